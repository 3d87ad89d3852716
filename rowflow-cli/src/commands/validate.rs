//! `rowflow validate` - check a configuration without running it.

use rowflow_core::registry::builtin_registry;
use rowflow_core::Result;
use std::path::PathBuf;

pub fn execute(config: PathBuf) -> Result<()> {
    rowflow_core::run::validate(&config, &builtin_registry())?;
    println!("{}: configuration OK", config.display());
    println!("note: classes resolved against built-in modules only");
    Ok(())
}
