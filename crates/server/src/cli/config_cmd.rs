use crate::cli::{ConfigAction, ConfigArgs, GlobalArgs};
use crate::config::AppConfig;

pub async fn execute(global: GlobalArgs, args: ConfigArgs) -> anyhow::Result<()> {
    let path = global.config.as_deref();
    match args.action {
        ConfigAction::Show => {
            let mut cfg = AppConfig::load(path)?;
            global.apply(&mut cfg);
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        ConfigAction::Set { key, value } => {
            let mut cfg = AppConfig::load(path)?;
            cfg.set(&key, &value)?;
            cfg.save(path)?;
            println!("Configuration updated.");
        }
    }
    Ok(())
}
