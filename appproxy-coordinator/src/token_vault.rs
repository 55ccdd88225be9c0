//! Token Vault: one-shot confirmation tokens for interactive
//! handoff, and long-lived bearer tokens authorizing inference endpoint
//! calls.

use std::sync::Arc;
use std::time::Duration;

use appproxy_core::model::{ApiToken, ConfirmationToken};
use appproxy_store::kv::KvStore;
use appproxy_store::{keys, typed, StoreError};
use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

const TOKEN_LEN: usize = 32;

pub struct TokenVault {
	store: Arc<dyn KvStore>,
}

impl TokenVault {
	pub fn new(store: Arc<dyn KvStore>) -> Self {
		Self { store }
	}

	pub async fn issue_confirmation(
		&self,
		user_id: Uuid,
		group_id: Uuid,
		access_key: &str,
		domain: &str,
		kernel_host: &str,
		kernel_port: u16,
		login_session_token: Option<String>,
		ttl: Duration,
	) -> Result<ConfirmationToken, StoreError> {
		let token = ConfirmationToken {
			token: generate_token().into(),
			user_id,
			group_id,
			access_key: access_key.into(),
			domain: domain.into(),
			kernel_host: kernel_host.into(),
			kernel_port,
			login_session_token: login_session_token.map(Into::into),
			expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(5)),
		};
		typed::put_typed_with_ttl(self.store.as_ref(), &keys::confirmation_token(&token.token), &token, ttl).await?;
		Ok(token)
	}

	/// Atomically consumes a confirmation token: at most one caller ever
	/// observes `Some` for a given token.
	pub async fn redeem_confirmation(&self, token: &str) -> Result<Option<ConfirmationToken>, StoreError> {
		let key = keys::confirmation_token(token);
		let Some(bytes) = self.store.get(&key).await? else { return Ok(None) };
		if !self.store.cas_delete(&key, &bytes).await? {
			// Someone else won the race to delete it first.
			return Ok(None);
		}
		let parsed: ConfirmationToken = serde_json::from_slice(&bytes)?;
		if parsed.is_expired() {
			return Ok(None);
		}
		Ok(Some(parsed))
	}

	pub async fn issue_api_token(
		&self,
		endpoint_id: Uuid,
		user_id: Uuid,
		exp: DateTime<Utc>,
	) -> Result<ApiToken, StoreError> {
		let token = ApiToken { token: generate_token().into(), endpoint_id, user_id, exp };
		let ttl = (exp - Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
		typed::put_typed_with_ttl(self.store.as_ref(), &keys::api_token(&token.token), &token, ttl).await?;
		Ok(token)
	}

	pub async fn verify_api_token(&self, token: &str, endpoint_id: Uuid) -> Result<bool, StoreError> {
		let Some(record) = typed::get_typed::<ApiToken>(self.store.as_ref(), &keys::api_token(token)).await? else {
			return Ok(false);
		};
		Ok(!record.is_expired() && record.endpoint_id == endpoint_id)
	}

	pub async fn revoke_api_token(&self, token: &str) -> Result<(), StoreError> {
		self.store.delete(&keys::api_token(token)).await
	}
}

fn generate_token() -> String {
	rand::rng().sample_iter(&Alphanumeric).map(char::from).take(TOKEN_LEN).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use appproxy_store::memory::MemoryStore;

	#[tokio::test]
	async fn confirmation_token_is_consumed_at_most_once() {
		let vault = TokenVault::new(Arc::new(MemoryStore::new()));
		let token = vault
			.issue_confirmation(
				Uuid::new_v4(),
				Uuid::new_v4(),
				"AKIA",
				"default",
				"10.0.0.7",
				30080,
				None,
				Duration::from_secs(300),
			)
			.await
			.unwrap();

		let first = vault.redeem_confirmation(&token.token).await.unwrap();
		assert!(first.is_some());
		let second = vault.redeem_confirmation(&token.token).await.unwrap();
		assert!(second.is_none());
	}

	#[tokio::test]
	async fn api_token_verifies_against_its_endpoint_only() {
		let vault = TokenVault::new(Arc::new(MemoryStore::new()));
		let endpoint = Uuid::new_v4();
		let token = vault.issue_api_token(endpoint, Uuid::new_v4(), Utc::now() + chrono::Duration::hours(1)).await.unwrap();
		assert!(vault.verify_api_token(&token.token, endpoint).await.unwrap());
		assert!(!vault.verify_api_token(&token.token, Uuid::new_v4()).await.unwrap());
	}

	#[tokio::test]
	async fn revoked_api_token_fails_verification() {
		let vault = TokenVault::new(Arc::new(MemoryStore::new()));
		let endpoint = Uuid::new_v4();
		let token = vault.issue_api_token(endpoint, Uuid::new_v4(), Utc::now() + chrono::Duration::hours(1)).await.unwrap();
		vault.revoke_api_token(&token.token).await.unwrap();
		assert!(!vault.verify_api_token(&token.token, endpoint).await.unwrap());
	}
}
