use std::io::Write;

use indexmap::IndexMap;

use super::*;
use crate::config::TransportConfig;

fn spec_with(
	env: IndexMap<String, String>,
	providers: Vec<SecretProviderConfig>,
) -> UpstreamServerSpec {
	UpstreamServerSpec {
		name: "test".into(),
		transport: TransportConfig::Stdio {
			command: "true".to_string(),
			args: Vec::new(),
			env: IndexMap::new(),
		},
		env,
		auth: None,
		secret_providers: providers,
	}
}

fn inline(pairs: &[(&str, &str)]) -> SecretProviderConfig {
	SecretProviderConfig::Inline {
		values: pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect(),
	}
}

#[tokio::test]
async fn test_precedence_later_wins() {
	let config = ProxyConfig {
		default_secret_providers: vec![inline(&[("A", "default"), ("B", "default")])],
		..Default::default()
	};
	let spec = spec_with(
		IndexMap::from([("B".to_string(), "inline".to_string())]),
		vec![inline(&[("A", "provider")])],
	);
	let resolved = resolve(&spec, &config).await;
	assert_eq!(resolved.get("A").map(String::as_str), Some("provider"));
	assert_eq!(resolved.get("B").map(String::as_str), Some("inline"));
}

#[tokio::test]
async fn test_dotenv_interpolation_with_forward_reference() {
	let mut file = tempfile::NamedTempFile::new().expect("temp file");
	write!(
		file,
		"HOME=/home/user\nPATH_WITH_VAR=\"$HOME/bin:$PATH\"\nPATH=/usr/bin:/bin\n"
	)
	.expect("write dotenv");

	let config = ProxyConfig::default();
	let spec = spec_with(
		IndexMap::new(),
		vec![SecretProviderConfig::Dotenv {
			path: file.path().display().to_string(),
			encoding: None,
		}],
	);
	let resolved = resolve(&spec, &config).await;
	assert_eq!(
		resolved.get("PATH_WITH_VAR").map(String::as_str),
		Some("/home/user/bin:/usr/bin:/bin")
	);
}

#[tokio::test]
async fn test_dotenv_circular_references_resolve_empty() {
	let mut file = tempfile::NamedTempFile::new().expect("temp file");
	write!(file, "A=\"$B\"\nB=\"$A\"\n").expect("write dotenv");

	let config = ProxyConfig::default();
	let spec = spec_with(
		IndexMap::new(),
		vec![SecretProviderConfig::Dotenv {
			path: file.path().display().to_string(),
			encoding: None,
		}],
	);
	let resolved = resolve(&spec, &config).await;
	assert_eq!(resolved.get("A").map(String::as_str), Some(""));
	assert_eq!(resolved.get("B").map(String::as_str), Some(""));
}

#[tokio::test]
async fn test_dotenv_missing_file_is_not_fatal() {
	let config = ProxyConfig::default();
	let spec = spec_with(
		IndexMap::from([("KEEP".to_string(), "me".to_string())]),
		vec![SecretProviderConfig::Dotenv {
			path: "/definitely/not/a/real/.env".to_string(),
			encoding: None,
		}],
	);
	let resolved = resolve(&spec, &config).await;
	assert_eq!(resolved.get("KEEP").map(String::as_str), Some("me"));
	assert_eq!(resolved.len(), 1);
}

#[test]
fn test_dotenv_parsing_rules() {
	let accumulated = IndexMap::from([("OUTER".to_string(), "from-chain".to_string())]);
	let parsed = dotenv::parse(
		concat!(
			"# comment\n",
			"export EXPORTED=yes\n",
			"PLAIN=value # trailing comment\n",
			"QUOTED=\"line1\\nline2\"\n",
			"SINGLE='$OUTER stays literal'\n",
			"REF=\"$OUTER\"\n",
			"UNDEFINED=\"$NOPE!\"\n",
		),
		&accumulated,
	);
	assert_eq!(parsed.get("EXPORTED").map(String::as_str), Some("yes"));
	assert_eq!(parsed.get("PLAIN").map(String::as_str), Some("value"));
	assert_eq!(parsed.get("QUOTED").map(String::as_str), Some("line1\nline2"));
	assert_eq!(
		parsed.get("SINGLE").map(String::as_str),
		Some("$OUTER stays literal")
	);
	assert_eq!(parsed.get("REF").map(String::as_str), Some("from-chain"));
	// Undefined references resolve to empty.
	assert_eq!(parsed.get("UNDEFINED").map(String::as_str), Some("!"));
}

#[tokio::test]
async fn test_process_provider_filters() {
	// set_var is unsafe in edition 2024; this test touches uniquely named
	// variables only.
	unsafe {
		std::env::set_var("MANIFOLD_SECRETS_TEST_ONE", "1");
		std::env::set_var("MANIFOLD_SECRETS_TEST_TWO", "2");
		std::env::set_var("OTHER_MANIFOLD_SECRETS_TEST", "3");
	}

	let config = ProxyConfig::default();
	let spec = spec_with(
		IndexMap::new(),
		vec![SecretProviderConfig::Process {
			prefix: Some("MANIFOLD_SECRETS_TEST_".to_string()),
			allowlist: None,
			blocklist: Some(vec!["MANIFOLD_SECRETS_TEST_TWO".to_string()]),
		}],
	);
	let resolved = resolve(&spec, &config).await;
	// The prefix is preserved on emitted keys.
	assert_eq!(
		resolved.get("MANIFOLD_SECRETS_TEST_ONE").map(String::as_str),
		Some("1")
	);
	assert!(!resolved.contains_key("MANIFOLD_SECRETS_TEST_TWO"));
	assert!(!resolved.contains_key("OTHER_MANIFOLD_SECRETS_TEST"));
}

#[tokio::test]
async fn test_blocklist_wins_over_allowlist() {
	unsafe {
		std::env::set_var("MANIFOLD_SECRETS_BOTH", "x");
	}
	let config = ProxyConfig::default();
	let spec = spec_with(
		IndexMap::new(),
		vec![SecretProviderConfig::Process {
			prefix: None,
			allowlist: Some(vec!["MANIFOLD_SECRETS_BOTH".to_string()]),
			blocklist: Some(vec!["MANIFOLD_SECRETS_BOTH".to_string()]),
		}],
	);
	let resolved = resolve(&spec, &config).await;
	assert!(resolved.is_empty());
}

#[tokio::test]
async fn test_passthrough_env_is_lowest_precedence() {
	unsafe {
		std::env::set_var("MANIFOLD_SECRETS_PASSTHROUGH", "ambient");
	}
	let config = ProxyConfig {
		default_passthrough_env: vec!["MANIFOLD_SECRETS_PASSTHROUGH".to_string()],
		default_secret_providers: vec![inline(&[("MANIFOLD_SECRETS_PASSTHROUGH", "provider")])],
		..Default::default()
	};
	let spec = spec_with(IndexMap::new(), Vec::new());
	let resolved = resolve(&spec, &config).await;
	assert_eq!(
		resolved.get("MANIFOLD_SECRETS_PASSTHROUGH").map(String::as_str),
		Some("provider")
	);
}
