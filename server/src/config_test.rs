use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_bind_all_interfaces_on_8080() {
    let config = ServerConfig::from_lookup(lookup_from(&[])).expect("config");
    assert_eq!(config.port, 8080);
    assert_eq!(config.socket_addr().to_string(), "0.0.0.0:8080");
    assert_eq!(config.assets_dir, PathBuf::from("public"));
}

#[test]
fn port_and_assets_dir_come_from_env() {
    let config = ServerConfig::from_lookup(lookup_from(&[("PORT", "9001"), ("ASSETS_DIR", "/srv/clocks")]))
        .expect("config");
    assert_eq!(config.port, 9001);
    assert_eq!(config.assets_dir, PathBuf::from("/srv/clocks"));
}

#[test]
fn bind_addr_override() {
    let config = ServerConfig::from_lookup(lookup_from(&[("BIND_ADDR", "127.0.0.1")])).expect("config");
    assert_eq!(config.socket_addr().to_string(), "127.0.0.1:8080");
}

#[test]
fn unparsable_port_is_an_error() {
    let err = ServerConfig::from_lookup(lookup_from(&[("PORT", "eighty")])).expect_err("port should fail");
    assert!(matches!(err, ConfigError::InvalidPort { ref value, .. } if value == "eighty"));
}

#[test]
fn out_of_range_port_is_an_error() {
    let err = ServerConfig::from_lookup(lookup_from(&[("PORT", "70000")])).expect_err("port should fail");
    assert!(matches!(err, ConfigError::InvalidPort { .. }));
}

#[test]
fn unparsable_bind_addr_is_an_error() {
    let err = ServerConfig::from_lookup(lookup_from(&[("BIND_ADDR", "localhost")])).expect_err("addr should fail");
    assert!(matches!(err, ConfigError::InvalidBindAddr { .. }));
}
