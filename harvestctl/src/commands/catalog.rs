use serde::Serialize;

use harvest_core::StepCatalog;

use crate::{AppContext, DisplayFallback, Result};

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub path: String,
    pub steps: usize,
}

impl DisplayFallback for ValidationReport {
    fn display(&self) -> String {
        format!("{}: {} steps, all valid", self.path, self.steps)
    }
}

pub fn validate(context: &AppContext) -> Result<ValidationReport> {
    let catalog = StepCatalog::from_csv_path(&context.steps_path)?;
    Ok(ValidationReport {
        path: context.steps_path.display().to_string(),
        steps: catalog.len(),
    })
}

#[derive(Debug, Serialize)]
pub struct CatalogListing {
    pub steps: Vec<StepEntry>,
}

#[derive(Debug, Serialize)]
pub struct StepEntry {
    pub name: String,
    pub strategy: String,
    pub value: String,
    pub action: String,
    pub keys: Option<String>,
}

impl DisplayFallback for CatalogListing {
    fn display(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            out.push_str(&format!(
                "{:<28} {:<7} {}={}\n",
                step.name, step.action, step.strategy, step.value
            ));
        }
        out.trim_end().to_string()
    }
}

pub fn list(context: &AppContext) -> Result<CatalogListing> {
    let catalog = StepCatalog::from_csv_path(&context.steps_path)?;
    let mut steps: Vec<StepEntry> = catalog
        .iter()
        .map(|step| StepEntry {
            name: step.name.clone(),
            strategy: step.locator.strategy.to_string(),
            value: step.locator.value.clone(),
            action: format!("{:?}", step.action).to_lowercase(),
            keys: step.default_keys.clone(),
        })
        .collect();
    steps.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(CatalogListing { steps })
}
