use domshell_core::{Config, Paths};
use serde_json::Value;

/// Show the effective configuration as pretty-printed JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    if config.gateway.auth_token.is_some() {
        config.gateway.auth_token = Some("(set)".to_string());
    }

    println!("# {}", paths.config_file().display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub async fn path() -> anyhow::Result<()> {
    println!("{}", Paths::new().config_file().display());
    Ok(())
}

/// Write the default configuration, refusing to clobber an existing file.
pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = paths.config_file();
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite it",
            config_path.display()
        );
    }
    paths.ensure_dirs()?;
    Config::default().save(&config_path)?;
    println!("✓ Wrote default config: {}", config_path.display());
    Ok(())
}

/// Get a config value by dot-separated key path.
pub async fn get(key: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let json = serde_json::to_value(&config)?;

    match resolve_json_path(&json, key) {
        Some(Value::String(s)) => println!("{}", s),
        Some(v) => println!("{}", serde_json::to_string_pretty(&v)?),
        None => anyhow::bail!("Key '{}' not found in config.", key),
    }
    Ok(())
}

/// Set a config value by dot-separated key path. The result must still
/// deserialize as a valid configuration.
pub async fn set(key: &str, value: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = paths.config_file();
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };
    let mut json = serde_json::to_value(&config)?;

    // JSON literals (true, 18795, "x") first, bare strings otherwise
    let parsed: Value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    set_json_path(&mut json, key, parsed.clone());

    let new_config: Config = serde_json::from_value(json)
        .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e))?;
    new_config.save(&config_path)?;

    match parsed {
        Value::String(s) => println!("✓ Set {} = {}", key, s),
        other => println!("✓ Set {} = {}", key, serde_json::to_string(&other)?),
    }
    Ok(())
}

fn resolve_json_path(json: &Value, path: &str) -> Option<Value> {
    let mut current = json;
    for part in path.split('.') {
        current = current
            .get(to_camel_case(part))
            .or_else(|| current.get(part))?;
    }
    Some(current.clone())
}

fn set_json_path(json: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = json;
    for (i, part) in parts.iter().enumerate() {
        let camel = to_camel_case(part);
        let key = if current.get(&camel).is_some() || current.get(*part).is_none() {
            camel
        } else {
            part.to_string()
        };

        if i == parts.len() - 1 {
            current[&key] = value;
            return;
        }

        if !current.get(&key).map(Value::is_object).unwrap_or(false) {
            current[&key] = serde_json::json!({});
        }
        current = &mut current[&key];
    }
}

/// Convert snake_case to camelCase.
fn to_camel_case(s: &str) -> String {
    let mut result = String::new();
    let mut capitalize_next = false;
    for ch in s.chars() {
        if ch == '_' {
            capitalize_next = true;
        } else if capitalize_next {
            result.push(ch.to_ascii_uppercase());
            capitalize_next = false;
        } else {
            result.push(ch);
        }
    }
    result
}
