use streamgate::config::{ApprovalPolicy, Config, DEFAULT_APPROVAL_EXPIRY_MS};
use std::time::Duration;

fn base_config() -> Config {
    Config {
        base_url: "http://localhost:8080".to_string(),
        api_key: None,
        retry: Default::default(),
        breaker: Default::default(),
        approvals: ApprovalPolicy::default(),
        monitor: Default::default(),
        malformed_frame_limit: 5,
    }
}

#[test]
fn test_config_validation_allows_local_endpoint_without_api_key() {
    assert!(base_config().validate().is_ok());
}

#[test]
fn test_config_validation_requires_api_key_for_remote_endpoints() {
    let config = Config {
        base_url: "https://gateway.example.com".to_string(),
        ..base_config()
    };

    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_rejects_non_http_urls() {
    let config = Config {
        base_url: "ftp://gateway.example.com".to_string(),
        ..base_config()
    };

    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_rejects_out_of_range_failure_rate() {
    let mut config = base_config();
    config.breaker.failure_rate_threshold = 1.5;

    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_rejects_zero_retry_attempts() {
    let mut config = base_config();
    config.retry.max_attempts = 0;

    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_rejects_zero_malformed_frame_tolerance() {
    let mut config = base_config();
    config.malformed_frame_limit = 0;

    assert!(config.validate().is_err());
}

#[test]
fn test_approval_policy_expiry_defaults_to_five_minutes() {
    let policy = ApprovalPolicy::default();

    assert_eq!(
        policy.expiry(),
        Duration::from_millis(DEFAULT_APPROVAL_EXPIRY_MS)
    );
    assert_eq!(DEFAULT_APPROVAL_EXPIRY_MS, 300_000);
}

#[test]
fn test_approval_policy_allow_list_and_global_toggle() {
    let policy = ApprovalPolicy {
        auto_approve_tools: vec!["calculator".to_string()],
        ..ApprovalPolicy::default()
    };
    assert!(policy.auto_approves("calculator"));
    assert!(!policy.auto_approves("file_write"));

    let all = ApprovalPolicy {
        auto_approve_all: true,
        ..ApprovalPolicy::default()
    };
    assert!(all.auto_approves("file_write"));
}
