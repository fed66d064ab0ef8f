use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use super::csv;
use super::error::{EngineError, EngineResult};

/// Closed set of element location strategies. Unknown tokens fail the
/// catalog load, never a mid-run lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    Id,
    Name,
    #[serde(rename = "xpath")]
    XPath,
    LinkText,
    PartialLinkText,
    TagName,
    ClassName,
    CssSelector,
}

impl fmt::Display for LocatorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LocatorStrategy::Id => "id",
            LocatorStrategy::Name => "name",
            LocatorStrategy::XPath => "xpath",
            LocatorStrategy::LinkText => "link_text",
            LocatorStrategy::PartialLinkText => "partial_link_text",
            LocatorStrategy::TagName => "tag_name",
            LocatorStrategy::ClassName => "class_name",
            LocatorStrategy::CssSelector => "css_selector",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for LocatorStrategy {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "id" => Ok(Self::Id),
            "name" => Ok(Self::Name),
            "xpath" => Ok(Self::XPath),
            "link_text" => Ok(Self::LinkText),
            "partial_link_text" => Ok(Self::PartialLinkText),
            "tag_name" => Ok(Self::TagName),
            "class_name" => Ok(Self::ClassName),
            "css_selector" => Ok(Self::CssSelector),
            other => Err(EngineError::Configuration(format!(
                "invalid locator strategy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
}

impl std::str::FromStr for ActionKind {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "click" => Ok(Self::Click),
            "type" => Ok(Self::Type),
            other => Err(EngineError::Configuration(format!(
                "invalid action kind: {other}"
            ))),
        }
    }
}

/// The page driver only knows two resolution paths, so every strategy
/// lowers to either a CSS selector or an XPath expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementQuery {
    Css(String),
    XPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Locator {
    pub strategy: LocatorStrategy,
    pub value: String,
}

impl Locator {
    pub fn new(strategy: LocatorStrategy, value: impl Into<String>) -> Self {
        Self {
            strategy,
            value: value.into(),
        }
    }

    pub fn to_query(&self) -> ElementQuery {
        match self.strategy {
            LocatorStrategy::Id => ElementQuery::Css(format!("[id={}]", css_literal(&self.value))),
            LocatorStrategy::Name => {
                ElementQuery::Css(format!("[name={}]", css_literal(&self.value)))
            }
            LocatorStrategy::ClassName => {
                ElementQuery::Css(format!("[class~={}]", css_literal(&self.value)))
            }
            LocatorStrategy::TagName => ElementQuery::Css(self.value.clone()),
            LocatorStrategy::CssSelector => ElementQuery::Css(self.value.clone()),
            LocatorStrategy::XPath => ElementQuery::XPath(self.value.clone()),
            LocatorStrategy::LinkText => ElementQuery::XPath(format!(
                "//a[normalize-space(.)={}]",
                xpath_literal(&self.value)
            )),
            LocatorStrategy::PartialLinkText => ElementQuery::XPath(format!(
                "//a[contains(.,{})]",
                xpath_literal(&self.value)
            )),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.strategy, self.value)
    }
}

fn css_literal(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{value}'")
    } else if !value.contains('"') {
        format!("\"{value}\"")
    } else {
        // Both quote kinds present: concat() is the only portable spelling.
        let parts: Vec<String> = value
            .split('\'')
            .map(|part| format!("'{part}'"))
            .collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// Step names the engine drives by itself. Catalogs may define more, but
/// these must be present for the flows that use them.
pub mod step_names {
    pub const FILL_USERNAME: &str = "fill username";
    pub const FILL_PASSWORD: &str = "fill password";
    pub const SUBMIT_LOGIN: &str = "click login button";
    pub const FILL_CODE: &str = "fill two-factor code";
    pub const SUBMIT_CODE: &str = "confirm two-factor code";
    pub const OPEN_SAVED_QUEUES: &str = "open saved queue menu";
    pub const OPEN_ALL_QUEUES: &str = "open full queue menu";
    pub const SEARCH_QUEUE: &str = "search for queue";
    pub const SELECT_QUEUE: &str = "select queue";
    pub const SWITCH_LIST_VIEW: &str = "switch to list view";
    pub const OPEN_MORE_MENU: &str = "open more menu";
    pub const CLICK_EXPORT: &str = "click export button";
    pub const OPEN_EXPORT_FORMATS: &str = "open export formats menu";
    pub const SELECT_EXPORT_FORMAT: &str = "select export format";
    pub const START_EXPORT: &str = "start export";
    pub const OPEN_DATA_TAB: &str = "open data tab";
    pub const EXPORT_DETAIL_HISTORY: &str = "export detail history";

    /// Steps that run while the session is not yet authenticated; the
    /// interference sweep must not fire around them.
    pub const LOGIN_FLOW: [&str; 5] = [
        FILL_USERNAME,
        FILL_PASSWORD,
        SUBMIT_LOGIN,
        FILL_CODE,
        SUBMIT_CODE,
    ];
}

#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub name: String,
    pub locator: Locator,
    pub action: ActionKind,
    pub default_keys: Option<String>,
}

/// Immutable table of named UI actions, loaded once at startup from CSV
/// rows `[description, strategy, value, keys, action]`.
#[derive(Debug, Clone, Default)]
pub struct StepCatalog {
    steps: HashMap<String, StepDefinition>,
}

impl StepCatalog {
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Configuration(format!(
                "failed to read step catalog {}: {err}",
                path.display()
            ))
        })?;
        Self::from_csv(&content)
    }

    pub fn from_csv(content: &str) -> EngineResult<Self> {
        let mut records = csv::read_records(content).into_iter();
        // Header row is mandatory.
        let header = records.next().ok_or_else(|| {
            EngineError::Configuration("step catalog is empty".to_string())
        })?;
        if header.first().map(String::as_str) != Some("description") {
            return Err(EngineError::Configuration(format!(
                "step catalog header not recognized: {header:?}"
            )));
        }

        let mut steps = HashMap::new();
        for (idx, record) in records.enumerate() {
            let row = idx + 2;
            if record.len() != 5 {
                return Err(EngineError::Configuration(format!(
                    "step catalog row {row}: expected 5 columns, found {}",
                    record.len()
                )));
            }
            let name = record[0].trim().to_string();
            if name.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "step catalog row {row}: empty description"
                )));
            }
            let strategy: LocatorStrategy = record[1].trim().parse().map_err(|err| {
                EngineError::Configuration(format!("step catalog row {row}: {err}"))
            })?;
            let action: ActionKind = record[4].trim().parse().map_err(|err| {
                EngineError::Configuration(format!("step catalog row {row}: {err}"))
            })?;
            let keys = record[3].trim();
            let definition = StepDefinition {
                name: name.clone(),
                locator: Locator::new(strategy, record[2].trim()),
                action,
                default_keys: if keys.is_empty() {
                    None
                } else {
                    Some(keys.to_string())
                },
            };
            if steps.insert(name.clone(), definition).is_some() {
                return Err(EngineError::Configuration(format!(
                    "step catalog row {row}: duplicate step '{name}'"
                )));
            }
        }
        Ok(Self { steps })
    }

    pub fn lookup(&self, name: &str) -> EngineResult<&StepDefinition> {
        self.steps.get(name).ok_or_else(|| {
            EngineError::Configuration(format!("unknown step '{name}'"))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
