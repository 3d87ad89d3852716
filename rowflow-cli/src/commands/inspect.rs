//! `rowflow inspect` - print the dataset layout of a container file.

use rowflow_core::store::TableFile;
use rowflow_core::Result;
use std::path::PathBuf;

pub fn execute(file: PathBuf, refs: bool) -> Result<()> {
    let container = TableFile::open(&file)?;

    println!("{}", file.display());
    let mut datasets = container.datasets();
    datasets.sort_by(|a, b| a.0.cmp(&b.0));
    for (path, rows, dtype) in &datasets {
        let is_ref = path.contains("/ref/");
        if is_ref && !refs {
            continue;
        }
        println!("  {:<40} {:>10} rows  {}", path, rows, dtype.describe());
    }

    if refs {
        for (alias, target) in container.aliases() {
            println!("  {:<40} -> {}", alias, target);
        }
    }

    for (path, _, _) in &datasets {
        let Some(group) = path.strip_suffix("/data") else {
            continue;
        };
        let attrs = container.attrs(group);
        for (key, value) in attrs {
            println!("  {}@{} = {}", group, key, value);
        }
    }
    Ok(())
}
