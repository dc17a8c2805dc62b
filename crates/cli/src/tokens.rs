//! Short-lived bearer tokens bound to an operator.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Grant {
	operator: String,
	expires_at: Instant,
}

/// Issued tokens. Expired entries are pruned whenever the store is used.
#[derive(Debug)]
pub struct TokenStore {
	ttl: Duration,
	grants: Mutex<HashMap<String, Grant>>,
}

impl TokenStore {
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			grants: Mutex::new(HashMap::new()),
		}
	}

	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	pub fn issue(&self, operator: &str) -> String {
		let token = Uuid::new_v4().to_string();
		let now = Instant::now();
		let mut grants = self.grants.lock();
		grants.retain(|_, grant| grant.expires_at > now);
		grants.insert(
			token.clone(),
			Grant {
				operator: operator.to_string(),
				expires_at: now + self.ttl,
			},
		);
		token
	}

	/// Returns the operator for a live token.
	pub fn validate(&self, token: &str) -> Option<String> {
		let now = Instant::now();
		let mut grants = self.grants.lock();
		grants.retain(|_, grant| grant.expires_at > now);
		grants.get(token).map(|grant| grant.operator.clone())
	}

	pub fn len(&self) -> usize {
		self.grants.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn tokens_expire_and_are_pruned() {
		let store = TokenStore::new(Duration::from_secs(300));
		let token = store.issue("alice");
		assert_eq!(store.validate(&token).as_deref(), Some("alice"));

		tokio::time::advance(Duration::from_secs(301)).await;
		assert_eq!(store.validate(&token), None);
		assert!(store.is_empty());
	}

	#[test]
	fn unknown_token_is_rejected() {
		let store = TokenStore::new(Duration::from_secs(60));
		store.issue("alice");
		assert_eq!(store.validate("not-a-token"), None);
		assert_eq!(store.len(), 1);
	}
}
