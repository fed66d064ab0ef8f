use clap::CommandFactory;

use crate::{Cli, CompletionsArgs, Result};

pub fn generate(args: &CompletionsArgs) -> Result<()> {
    let mut command = Cli::command();
    clap_complete::generate(args.shell, &mut command, "harvestctl", &mut std::io::stdout());
    Ok(())
}
