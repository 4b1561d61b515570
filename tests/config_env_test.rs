//! Environment overrides. Kept in its own test binary: the process
//! environment is shared by every test in a binary.

use claimq::config::{Config, ExhaustionPolicy};

#[test]
fn config_from_env_applies_overrides() {
    unsafe {
        std::env::set_var("CLAIMQ_INPUT", "/data/accounts.csv");
        std::env::set_var("CLAIMQ_MAX_CONCURRENCY", "8");
        std::env::set_var("CLAIMQ_ON_EXHAUSTED", "requeue");
        std::env::set_var("CLAIMQ_LOCK_TIMEOUT_MS", "");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.input_path, std::path::PathBuf::from("/data/accounts.csv"));
    assert_eq!(config.max_concurrency, 8);
    assert_eq!(config.on_exhausted, ExhaustionPolicy::Requeue);
    // Empty values count as unset.
    assert_eq!(config.lock_timeout(), None);

    unsafe {
        std::env::set_var("CLAIMQ_MAX_CONCURRENCY", "many");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("CLAIMQ_MAX_CONCURRENCY", "0");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::remove_var("CLAIMQ_INPUT");
        std::env::remove_var("CLAIMQ_MAX_CONCURRENCY");
        std::env::remove_var("CLAIMQ_ON_EXHAUSTED");
        std::env::remove_var("CLAIMQ_LOCK_TIMEOUT_MS");
    }
}
