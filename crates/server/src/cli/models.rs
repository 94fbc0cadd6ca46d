use crate::cli::{GlobalArgs, ModelsAction, ModelsArgs};
use crate::config::AppConfig;
use crate::services::registry;

pub async fn execute(global: GlobalArgs, args: ModelsArgs) -> anyhow::Result<()> {
    match args.action {
        ModelsAction::List { dir } => {
            let mut cfg = AppConfig::load(global.config.as_deref())?;
            global.apply(&mut cfg);
            let search_dir = dir.unwrap_or_else(|| cfg.models_dir.clone());

            let entries = registry::scan(&search_dir, &cfg.model_params(), &cfg.model_settings)?;

            if entries.is_empty() {
                println!("No GGUF models found in {}", search_dir.display());
                return Ok(());
            }

            println!("{:<40} {:<10} {:<8} {:<6}", "Name", "Size", "Ctx", "Parts");
            println!("{}", "-".repeat(66));
            for entry in &entries {
                println!(
                    "{:<40} {:<10} {:<8} {:<6}",
                    entry.name,
                    human_size(entry.file_size),
                    entry.params.ctx_size,
                    entry.split_parts.len()
                );
            }
            println!("\n{} model(s) found.", entries.len());
        }
    }
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for &unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}

#[cfg(test)]
mod tests {
    use super::human_size;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(4 * 1024 * 1024 * 1024), "4.0 GiB");
    }
}
