use tempfile::TempDir;

use super::*;

fn write_tenants(dir: &TempDir, body: &str) -> JsonFileCredentialStore {
	let path = dir.path().join("tenants.json");
	std::fs::write(&path, body).unwrap();
	JsonFileCredentialStore::new(path)
}

#[tokio::test]
async fn certificate_record_defaults_directory_to_tenant() {
	let dir = TempDir::new().unwrap();
	let store = write_tenants(
		&dir,
		r#"{"tenants": {"contoso": {"kind": "certificate", "applicationId": "app-1", "certificateThumbprint": "ABC123"}}}"#,
	);

	let descriptor = store.get_credentials("contoso", "contoso.onmicrosoft.com").await.unwrap();
	assert_eq!(
		descriptor,
		CredentialDescriptor::Certificate {
			application_id: "app-1".into(),
			certificate_thumbprint: "ABC123".into(),
			directory_id: "contoso.onmicrosoft.com".into(),
		}
	);
}

#[tokio::test]
async fn explicit_directory_id_wins() {
	let dir = TempDir::new().unwrap();
	let store = write_tenants(
		&dir,
		r#"{"tenants": {"contoso": {"kind": "certificate", "applicationId": "a", "certificateThumbprint": "t", "directoryId": "guid-1"}}}"#,
	);
	match store.get_credentials("contoso", "other").await.unwrap() {
		CredentialDescriptor::Certificate { directory_id, .. } => assert_eq!(directory_id, "guid-1"),
		other => panic!("unexpected descriptor: {other:?}"),
	}
}

#[tokio::test]
async fn interactive_record_with_inline_password() {
	let dir = TempDir::new().unwrap();
	let store = write_tenants(
		&dir,
		r#"{"tenants": {"fabrikam": {"kind": "interactive", "username": "admin@fabrikam.com", "password": "hunter2"}}}"#,
	);
	let descriptor = store.get_credentials("fabrikam", "fabrikam").await.unwrap();
	assert_eq!(descriptor.variant(), tenantshell_protocol::CredentialVariant::Interactive);
	assert_eq!(descriptor.secrets(), vec!["hunter2".to_string()]);
}

#[tokio::test]
async fn interactive_record_reads_password_env() {
	let dir = TempDir::new().unwrap();
	let var = format!("TENANTSHELL_TEST_PW_{}", std::process::id());
	// SAFETY: the variable name is unique to this test.
	unsafe { std::env::set_var(&var, "from-env") };
	let store = write_tenants(
		&dir,
		&format!(r#"{{"tenants": {{"fabrikam": {{"kind": "interactive", "username": "u", "passwordEnv": "{var}"}}}}}}"#),
	);
	let descriptor = store.get_credentials("fabrikam", "fabrikam").await.unwrap();
	assert_eq!(descriptor.secrets(), vec!["from-env".to_string()]);
	unsafe { std::env::remove_var(&var) };
}

#[tokio::test]
async fn missing_password_env_is_a_credentials_error() {
	let dir = TempDir::new().unwrap();
	let store = write_tenants(
		&dir,
		r#"{"tenants": {"fabrikam": {"kind": "interactive", "username": "u", "passwordEnv": "TENANTSHELL_TEST_UNSET_VAR"}}}"#,
	);
	let err = store.get_credentials("fabrikam", "fabrikam").await.unwrap_err();
	assert!(matches!(err, RelayError::Credentials(_)), "{err:?}");
}

#[tokio::test]
async fn record_without_kind_is_rejected() {
	let dir = TempDir::new().unwrap();
	let store = write_tenants(&dir, r#"{"tenants": {"contoso": {"applicationId": "a", "certificateThumbprint": "t"}}}"#);
	let err = store.get_credentials("contoso", "contoso").await.unwrap_err();
	assert!(matches!(err, RelayError::Credentials(_)), "{err:?}");
}

#[tokio::test]
async fn unknown_ref_and_missing_file() {
	let dir = TempDir::new().unwrap();
	let store = JsonFileCredentialStore::new(dir.path().join("absent.json"));
	let err = store.get_credentials("contoso", "contoso").await.unwrap_err();
	assert!(matches!(err, RelayError::UnknownTenant(ref name) if name == "contoso"));
	assert!(store.names().await.unwrap().is_empty());
}

#[tokio::test]
async fn edits_apply_without_restart() {
	let dir = TempDir::new().unwrap();
	let store = write_tenants(&dir, r#"{"tenants": {}}"#);
	assert!(store.get_credentials("contoso", "contoso").await.is_err());

	std::fs::write(
		store.path(),
		r#"{"tenants": {"contoso": {"kind": "certificate", "applicationId": "a", "certificateThumbprint": "t"}}}"#,
	)
	.unwrap();
	assert!(store.get_credentials("contoso", "contoso").await.is_ok());
	assert_eq!(store.names().await.unwrap(), vec!["contoso".to_string()]);
}

#[tokio::test]
async fn memory_store_returns_inserted_descriptor() {
	let store = MemoryCredentialStore::new();
	store.insert(
		"contoso",
		CredentialDescriptor::Interactive {
			username: "u".into(),
			secret: Secret::new("s"),
		},
	);
	assert!(store.get_credentials("contoso", "contoso").await.is_ok());
	assert!(matches!(
		store.get_credentials("fabrikam", "fabrikam").await,
		Err(RelayError::UnknownTenant(_))
	));
}
