use std::path::PathBuf;

const APP_DIR: &str = "aid-bench";

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/aid-bench/ (XDG standard)
    // instead of macOS Application Support for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        // On Windows, check for portable data directory in executable directory first
        if let Some(portable) = beside_exe("data") {
            return portable;
        }

        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(portable) = beside_exe("config.toml") {
            if let Some(dir) = portable.parent() {
                return dir.to_path_buf();
            }
        }
    }

    // On macOS and Linux, always use ~/.config/aid-bench/
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn temp_dir() -> PathBuf {
    std::env::temp_dir()
}

pub fn cache_dir() -> PathBuf {
    // ~/.cache/aid-bench/ on unix; previews are disposable
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(temp_dir)
            .join(".cache")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::cache_dir()
            .unwrap_or_else(temp_dir)
            .join(APP_DIR)
    }
}

#[cfg(windows)]
fn beside_exe(name: &str) -> Option<PathBuf> {
    let exe_path = std::env::current_exe().ok()?;
    let candidate = exe_path.parent()?.join(name);
    candidate.exists().then_some(candidate)
}
