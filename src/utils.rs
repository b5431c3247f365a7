//! Directory helpers following the XDG Base Directory specification
//!
//! - Config: `~/.config/netwarden/` - engine configuration
//! - Data: `~/.local/share/netwarden/` - policy store documents
//! - State: `~/.local/state/netwarden/` - audit log
//!
//! System paths (the persisted nftables config, its backups) are not XDG
//! paths; they come from [`EngineConfig`](crate::config::EngineConfig).

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "netwarden", "netwarden")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        for dir in [get_config_dir(), get_data_dir(), get_state_dir()]
            .into_iter()
            .flatten()
        {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        for dir in [get_config_dir(), get_data_dir(), get_state_dir()]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}
