//! Clap command surface (§10.3): the CLI flags for the configuration
//! table in [`crate::multiproc::config`]. Flags carry no `.env()`/default wiring of their
//! own — [`crate::multiproc::config::CoreConfig`] already owns the
//! document→environment precedence (§9), so a flag here is either absent
//! (the document/environment value stands) or an explicit override, and
//! [`super::apply_overrides`] only applies the ones the user actually gave.

use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

use crate::build_info::built_info;

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("gunicorn-sidecar-exporter")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(built_info::GIT_COMMIT_HASH.to_owned())
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(Arg::new("config").long("config").value_name("PATH").help("Structured configuration document (YAML)"))
        .arg(Arg::new("metrics-port").long("metrics-port").value_name("PORT").value_parser(clap::value_parser!(u16)).help("Port the scrape endpoint binds to"))
        .arg(Arg::new("bind-address").long("bind-address").value_name("ADDR").help("Address the scrape endpoint binds to"))
        .arg(Arg::new("workers").long("workers").value_name("N").value_parser(clap::value_parser!(u32)).help("Number of worker processes to fork"))
        .arg(Arg::new("multiproc-dir").long("multiproc-dir").value_name("DIR").help("Shared directory for the file-backed storage dict"))
        .arg(Arg::new("redis-enabled").long("redis-enabled").action(ArgAction::SetTrue).help("Select the network (Redis) storage back-end"))
        .arg(Arg::new("redis-host").long("redis-host").value_name("HOST"))
        .arg(Arg::new("redis-port").long("redis-port").value_name("PORT").value_parser(clap::value_parser!(u16)))
        .arg(Arg::new("redis-db").long("redis-db").value_name("DB").value_parser(clap::value_parser!(u32)))
        .arg(Arg::new("redis-password").long("redis-password").value_name("PASSWORD"))
        .arg(Arg::new("redis-key-prefix").long("redis-key-prefix").value_name("PREFIX"))
        .arg(Arg::new("redis-ttl-seconds").long("redis-ttl-seconds").value_name("SECONDS").value_parser(clap::value_parser!(u64)))
        .arg(Arg::new("redis-ttl-disabled").long("redis-ttl-disabled").action(ArgAction::SetTrue))
        .arg(Arg::new("ssl-cert").long("ssl-cert").value_name("PATH"))
        .arg(Arg::new("ssl-key").long("ssl-key").value_name("PATH"))
        .arg(Arg::new("ssl-client-ca").long("ssl-client-ca").value_name("PATH"))
        .arg(Arg::new("ssl-client-auth-required").long("ssl-client-auth-required").action(ArgAction::SetTrue))
        .arg(Arg::new("cleanup-db-files").long("cleanup-db-files").action(ArgAction::SetTrue).help("Purge this process's file-backed artifacts on exit"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_explicit_overrides() {
        let matches = new().get_matches_from(vec!["gunicorn-sidecar-exporter"]);
        assert!(matches.get_one::<u16>("metrics-port").is_none());
        assert!(!matches.get_flag("redis-enabled"));
    }

    #[test]
    fn parses_explicit_flags() {
        let matches = new().get_matches_from(vec![
            "gunicorn-sidecar-exporter",
            "--metrics-port",
            "9999",
            "--bind-address",
            "127.0.0.1",
            "--workers",
            "8",
            "--redis-enabled",
        ]);
        assert_eq!(matches.get_one::<u16>("metrics-port").copied(), Some(9999));
        assert_eq!(matches.get_one::<String>("bind-address").map(String::as_str), Some("127.0.0.1"));
        assert_eq!(matches.get_one::<u32>("workers").copied(), Some(8));
        assert!(matches.get_flag("redis-enabled"));
    }

    #[test]
    fn version_and_name_are_set() {
        let cmd = new();
        assert_eq!(cmd.get_name(), "gunicorn-sidecar-exporter");
        assert_eq!(cmd.get_version().unwrap().to_string(), env!("CARGO_PKG_VERSION"));
    }
}
