//! Layering of defaults, the TOML file, the environment and CLI flags.
use cabalwatch::cli::{Cli, Command};
use cabalwatch::config::{Config, OutputFormat, DEFAULT_CONFIG_FILE};
use figment::Jail;
use std::net::SocketAddr;
use std::path::PathBuf;

fn cli(command: Command) -> Cli {
    Cli {
        config: None,
        log_level: None,
        data_dir: None,
        json: false,
        command,
    }
}

fn inspect() -> Command {
    Command::Inspect {
        url: "https://whitecat.fun/".to_string(),
    }
}

fn load(cli: &Cli) -> figment::error::Result<Config> {
    Config::load(cli).map_err(|e| format!("{:#}", e).into())
}

#[test]
fn test_load_full_valid_config() {
    Jail::expect_with(|jail| {
        jail.create_file(
            DEFAULT_CONFIG_FILE,
            r#"
            log_level = "debug"
            data_dir = "/var/lib/cabalwatch"
            [stream]
            certstream_url = "ws://127.0.0.1:8181"
            max_retries = 3
            allow_invalid_certs = true
            [dns]
            resolver = "1.1.1.1:53"
            timeout_ms = 500
            [matching]
            suffixes = [".bet"]
            pattern_files = ["/etc/cabalwatch/patterns.yml"]
            excluded = ["example.org"]
            [extraction]
            static_timeout_secs = 5
            [extraction.remote_browser]
            endpoint = "https://chrome.browserless.io"
            token = "abc"
            timeout_secs = 30
            [extraction.local_browser]
            binary = "/usr/bin/chromium"
            timeout_secs = 45
            [verification]
            enabled = false
            concurrency = 2
            [output]
            format = "Json"
            [output.slack]
            webhook_url = "https://hooks.slack.com/services/T000/B000/XXX"
            [metrics]
            enabled = true
            listen_address = "0.0.0.0:9100"
            "#,
        )?;

        let config = load(&cli(inspect()))?;

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/cabalwatch"));
        assert_eq!(config.stream.certstream_url, "ws://127.0.0.1:8181");
        assert_eq!(config.stream.max_retries, 3);
        assert!(config.stream.allow_invalid_certs);
        // Not in the file, so the default survives.
        assert_eq!(config.stream.stall_timeout_secs, 40);
        assert_eq!(config.dns.resolver.as_deref(), Some("1.1.1.1:53"));
        assert_eq!(config.dns.timeout_ms, 500);
        assert_eq!(config.dns.attempts, 1);
        assert_eq!(config.matching.suffixes, vec![".bet".to_string()]);
        assert_eq!(
            config.matching.pattern_files,
            vec![PathBuf::from("/etc/cabalwatch/patterns.yml")]
        );
        assert_eq!(config.matching.excluded, vec!["example.org".to_string()]);
        assert_eq!(config.extraction.static_timeout_secs, 5);
        let remote = config.extraction.remote_browser.clone().unwrap();
        assert_eq!(remote.endpoint, "https://chrome.browserless.io");
        assert_eq!(remote.token.as_deref(), Some("abc"));
        let local = config.extraction.local_browser.clone().unwrap();
        assert_eq!(local.binary, PathBuf::from("/usr/bin/chromium"));
        assert!(!config.verification.enabled);
        assert_eq!(config.verification.concurrency, 2);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(
            config.output.slack.unwrap().webhook_url,
            "https://hooks.slack.com/services/T000/B000/XXX"
        );
        assert!(config.metrics.enabled);
        assert_eq!(
            config.metrics.listen_address,
            "0.0.0.0:9100".parse::<SocketAddr>().unwrap()
        );
        Ok(())
    });
}

#[test]
fn test_missing_file_gives_defaults() {
    Jail::expect_with(|_jail| {
        let config = load(&cli(inspect()))?;
        assert_eq!(config, Config::default());
        Ok(())
    });
}

#[test]
fn test_explicit_config_path() {
    Jail::expect_with(|jail| {
        jail.create_file("custom.toml", "log_level = \"warn\"")?;
        // Ignored: an explicit path replaces the default lookup.
        jail.create_file(DEFAULT_CONFIG_FILE, "log_level = \"trace\"")?;

        let mut args = cli(inspect());
        args.config = Some(PathBuf::from("custom.toml"));
        let config = load(&args)?;

        assert_eq!(config.log_level, "warn");
        Ok(())
    });
}

#[test]
fn test_invalid_value_type() {
    Jail::expect_with(|jail| {
        jail.create_file(DEFAULT_CONFIG_FILE, "[stream]\nmax_retries = \"three\"")?;

        let result = Config::load(&cli(inspect()));

        assert!(result.is_err());
        Ok(())
    });
}

#[test]
fn test_environment_overrides_file() {
    Jail::expect_with(|jail| {
        jail.create_file(
            DEFAULT_CONFIG_FILE,
            "log_level = \"debug\"\n[stream]\nmax_retries = 3",
        )?;
        jail.set_env("CABALWATCH_STREAM__MAX_RETRIES", 7);
        jail.set_env("CABALWATCH_DNS__TIMEOUT_MS", 750);

        let config = load(&cli(inspect()))?;

        assert_eq!(config.stream.max_retries, 7);
        assert_eq!(config.dns.timeout_ms, 750);
        assert_eq!(config.log_level, "debug");
        Ok(())
    });
}

#[test]
fn test_cli_overrides_everything() {
    Jail::expect_with(|jail| {
        jail.create_file(
            DEFAULT_CONFIG_FILE,
            "log_level = \"debug\"\n[stream]\nmax_retries = 3\ncertstream_url = \"ws://file.test\"",
        )?;
        jail.set_env("CABALWATCH_STREAM__MAX_RETRIES", 7);

        let mut args = cli(Command::Listen {
            certstream_url: Some("wss://cli.test".to_string()),
            max_retries: Some(1),
        });
        args.log_level = Some("error".to_string());
        args.data_dir = Some(PathBuf::from("/tmp/cabal"));
        args.json = true;
        let config = load(&args)?;

        assert_eq!(config.stream.max_retries, 1);
        assert_eq!(config.stream.certstream_url, "wss://cli.test");
        assert_eq!(config.log_level, "error");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/cabal"));
        assert_eq!(config.output.format, OutputFormat::Json);
        Ok(())
    });
}

#[test]
fn test_unset_cli_flags_do_not_override() {
    Jail::expect_with(|jail| {
        jail.create_file(
            DEFAULT_CONFIG_FILE,
            "[stream]\nmax_retries = 3\n[output]\nformat = \"Json\"",
        )?;

        let args = cli(Command::Listen {
            certstream_url: None,
            max_retries: None,
        });
        let config = load(&args)?;

        assert_eq!(config.stream.max_retries, 3);
        assert_eq!(config.output.format, OutputFormat::Json);
        Ok(())
    });
}
