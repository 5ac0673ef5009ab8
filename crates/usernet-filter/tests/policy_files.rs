use std::io::Write;

use pretty_assertions::assert_eq;
use usernet_filter::policy::ValidationError;
use usernet_filter::{load_policy, save_policy_json, Action, PolicyError, PortRange, Protocol};

const EXAMPLE_YAML: &str = r#"
version: "1.0"
rules:
  - name: deny-all
    action: deny
    priority: 1000
  - name: github
    action: allow
    priority: 10
    egress:
      protocols: [tcp]
      domains: ["github.com", "*.GitHub.com"]
      ports: ["443", "8000-8100"]
  - name: internal
    action: allow
    priority: 20
    egress:
      ips: ["10.0.0.0/8", "192.168.127.254"]
"#;

fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_yaml_file_sorted_by_priority() {
    let file = write_temp(".yaml", EXAMPLE_YAML);
    let policy = load_policy(file.path()).unwrap();

    let names: Vec<&str> = policy.rules.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["github", "internal", "deny-all"]);

    let github = policy.rules[0].egress.as_ref().unwrap();
    assert_eq!(github.protocols, vec![Protocol::Tcp]);
    assert_eq!(github.domains, vec!["github.com", "*.github.com"]);
    assert_eq!(
        github.ports,
        vec![PortRange::single(443), PortRange { start: 8000, end: 8100 }]
    );
    assert!(policy.rules[2].matches_all());
    assert_eq!(policy.rules[2].action, Action::Deny);
}

#[test]
fn unknown_extension_falls_back_to_json() {
    let json = r#"{"version":"1.0","rules":[{"name":"all","action":"allow","priority":1}]}"#;
    let file = write_temp(".policy", json);
    let policy = load_policy(file.path()).unwrap();
    assert_eq!(policy.rules.len(), 1);
    assert!(policy.rules[0].is_allow());
}

#[test]
fn saved_json_loads_back_identically() {
    let file = write_temp(".yml", EXAMPLE_YAML);
    let policy = load_policy(file.path()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("policy.json");
    save_policy_json(&policy, &out).unwrap();

    let text = std::fs::read_to_string(&out).unwrap();
    assert!(text.starts_with("{\n  \"version\": \"1.0\""), "{text}");
    assert!(text.contains("\"192.168.127.254\""), "{text}");

    assert_eq!(load_policy(&out).unwrap(), policy);
}

#[test]
fn version_two_is_rejected() {
    let file = write_temp(
        ".yaml",
        "version: \"2.0\"\nrules:\n  - name: a\n    action: allow\n    priority: 1\n",
    );
    let err = load_policy(file.path()).unwrap_err();
    assert!(matches!(
        &err,
        PolicyError::Invalid(ValidationError::UnsupportedVersion(v)) if v == "2.0"
    ));
    assert!(err.to_string().contains("2.0"), "{err}");
}

#[test]
fn duplicate_names_are_rejected() {
    let file = write_temp(
        ".yaml",
        r#"
version: "1.0"
rules:
  - name: a
    action: allow
    priority: 1
  - name: a
    action: deny
    priority: 2
"#,
    );
    assert!(matches!(
        load_policy(file.path()),
        Err(PolicyError::Invalid(ValidationError::DuplicateName(name))) if name == "a"
    ));
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_policy(dir.path().join("nope.yaml")).unwrap_err();
    assert!(matches!(err, PolicyError::Read(_)));
}
