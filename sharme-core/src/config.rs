//! Environment-driven configuration: gateway lists, network switch,
//! and the local home directory.
//!
//! Plain `std::env::var` with explicit fallbacks, reaching for `dirs`
//! only for the platform-appropriate home directory.

use std::path::PathBuf;

const DEFAULT_GQL_GATEWAYS: &[&str] = &["https://arweave.net/graphql"];
const DEFAULT_DATA_GATEWAYS: &[&str] = &["https://arweave.net"];

#[derive(Clone, Debug)]
pub struct Config {
    pub home: PathBuf,
    pub graphql_gateways: Vec<String>,
    pub data_gateways: Vec<String>,
    pub testnet: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let home = std::env::var("SHARME_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home());

        Self {
            home,
            graphql_gateways: parse_gateway_list("SHARME_ARWEAVE_GQLS", DEFAULT_GQL_GATEWAYS),
            data_gateways: parse_gateway_list("SHARME_ARWEAVE_DATAS", DEFAULT_DATA_GATEWAYS),
            testnet: std::env::var("SHARME_TESTNET")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("db")
    }

    pub fn salt_path(&self) -> PathBuf {
        self.home.join("salt")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.home.join("identity.enc")
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.home.join("shards")
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sharme")
}

fn parse_gateway_list(var: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SHARME_ARWEAVE_GQLS");
        std::env::remove_var("SHARME_ARWEAVE_DATAS");
        std::env::remove_var("SHARME_TESTNET");

        let cfg = Config::from_env();
        assert_eq!(cfg.graphql_gateways, vec!["https://arweave.net/graphql"]);
        assert!(!cfg.testnet);
    }

    #[test]
    fn parses_comma_separated_and_strips_trailing_slash() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SHARME_ARWEAVE_GQLS", "https://a.example/graphql/, https://b.example/graphql");
        let cfg = Config::from_env();
        assert_eq!(
            cfg.graphql_gateways,
            vec!["https://a.example/graphql", "https://b.example/graphql"]
        );
        std::env::remove_var("SHARME_ARWEAVE_GQLS");
    }

    #[test]
    fn empty_override_falls_back_to_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SHARME_ARWEAVE_DATAS", "");
        let cfg = Config::from_env();
        assert_eq!(cfg.data_gateways, vec!["https://arweave.net"]);
        std::env::remove_var("SHARME_ARWEAVE_DATAS");
    }
}
