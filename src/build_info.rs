//! Build-time metadata via `built`, promoted to a normal build-dependency
//! since both the CLI `--version` output and the `/health` handler surface
//! the git commit.

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = if let Some(hash) = built_info::GIT_COMMIT_HASH { hash } else { ":-(" };
