#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("store backend error: {0}")]
	Backend(String),
	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("key not found: {0}")]
	NotFound(String),
	#[error("compare-and-swap conflict on {0}")]
	CasConflict(String),
}

impl StoreError {
	/// Transient store/bus errors are retried with capped exponential
	/// backoff by callers; CAS conflicts and
	/// not-found are not retryable on their own, they are decision points.
	pub fn is_retryable(&self) -> bool {
		matches!(self, StoreError::Backend(_))
	}
}

impl From<etcd_client::Error> for StoreError {
	fn from(value: etcd_client::Error) -> Self {
		StoreError::Backend(value.to_string())
	}
}
