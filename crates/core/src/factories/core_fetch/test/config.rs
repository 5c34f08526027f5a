use crate::factories::core_fetch::{config::*, MOD_NAME};
use codefetch_api::config::Config;

#[test]
fn hand_edited_config_keeps_defaults_for_missing_fields() {
    let config: Config = serde_json::from_value(serde_json::json!({
        "CodeFetch": {
            "codeFetch": {
                "maxRetries": 9,
                "sendIntervalMs": 100,
            }
        }
    }))
    .unwrap();

    let fetch = config
        .get_module_config::<CodeFetchModConfig>(MOD_NAME)
        .unwrap()
        .code_fetch;
    assert_eq!(9, fetch.max_retries);
    assert_eq!(100, fetch.send_interval_ms);
    assert_eq!(
        CodeFetchConfig {
            max_retries: 9,
            send_interval_ms: 100,
            ..Default::default()
        },
        fetch
    );
}

#[test]
fn default_config_uses_camel_case_names() {
    let mut config = Config::default();
    config
        .add_default_module_config::<CodeFetchModConfig>(MOD_NAME.into())
        .unwrap();
    let value = serde_json::to_value(&config).unwrap();
    assert_eq!(
        serde_json::json!(5120),
        value["CodeFetch"]["codeFetch"]["requestWatchdogMs"]
    );
}
