use std::{collections::HashMap, fs};

#[derive(Debug)]
pub struct Settings {
    pub server_url: String,
    pub usuario: Option<String>,
    pub clave: Option<String>,
    pub refresh_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".into(),
            usuario: None,
            clave: None,
            refresh_secs: 300,
        }
    }
}

/// Layered settings: `monitor.toml` in the working directory, then
/// environment variables, then CLI flags applied by the caller.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("monitor.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("usuario") {
                settings.usuario = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("clave") {
                settings.clave = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("refresh_secs") {
                if let Ok(parsed) = v.parse() {
                    settings.refresh_secs = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("DISPATCH_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("DISPATCH_USUARIO") {
        settings.usuario = Some(v);
    }
    if let Ok(v) = std::env::var("DISPATCH_CLAVE") {
        settings.clave = Some(v);
    }
    if let Ok(v) = std::env::var("DISPATCH_REFRESH_SECS") {
        if let Ok(parsed) = v.parse() {
            settings.refresh_secs = parsed;
        }
    }

    settings
}
