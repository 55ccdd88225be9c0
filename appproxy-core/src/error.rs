use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The wire-visible error taxonomy. Every coordinator REST
/// handler and every worker admission check reduces its failure to one of
/// these before it reaches a client or the Manager.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorCode {
	ConfigError,
	NotFound,
	WorkerNotResponding,
	EventNotDelivered,
	SetupTimeout,
	ProtocolMismatch,
	MissingCookie,
	InvalidCookie,
	MissingAuthToken,
	InvalidAuthScheme,
	InvalidAuthToken,
	UnknownSubdomain,
	BackendDied,
	ModeMismatchInference,
	ModeMismatchInteractive,
	WorkerRegistrationFailed,
	NoSlotAvailable,
	NoWorkerAvailable,
	/// Client address outside `allowed_client_ips`, the first admission
	/// check. Like the resource errors below, it gets no numbered code.
	ClientIpNotAllowed,
	Internal,
}

impl ErrorCode {
	pub fn as_str(self) -> &'static str {
		match self {
			ErrorCode::ConfigError => "E00001",
			ErrorCode::NotFound => "E00002",
			ErrorCode::WorkerNotResponding => "E10001",
			ErrorCode::EventNotDelivered => "E20001",
			ErrorCode::ProtocolMismatch => "E20002",
			ErrorCode::SetupTimeout => "E20003",
			ErrorCode::MissingCookie => "E20004",
			ErrorCode::InvalidCookie => "E20005",
			ErrorCode::MissingAuthToken => "E20006",
			ErrorCode::InvalidAuthScheme => "E20007",
			ErrorCode::InvalidAuthToken => "E20008",
			ErrorCode::UnknownSubdomain => "E20009",
			ErrorCode::BackendDied => "E20010",
			ErrorCode::ModeMismatchInference => "E20011",
			ErrorCode::ModeMismatchInteractive => "E20012",
			ErrorCode::WorkerRegistrationFailed => "E20013",
			// Resource errors (Slot Ledger / Worker Selector) have no
			// numbered code; they are reported as plain 503s.
			ErrorCode::NoSlotAvailable => "no slot available",
			ErrorCode::NoWorkerAvailable => "no worker available",
			ErrorCode::ClientIpNotAllowed => "client ip not allowed",
			ErrorCode::Internal => "E50000",
		}
	}

	fn status(self) -> StatusCode {
		match self {
			ErrorCode::ConfigError => StatusCode::INTERNAL_SERVER_ERROR,
			ErrorCode::NotFound => StatusCode::NOT_FOUND,
			ErrorCode::WorkerNotResponding
			| ErrorCode::EventNotDelivered
			| ErrorCode::SetupTimeout
			| ErrorCode::NoSlotAvailable
			| ErrorCode::NoWorkerAvailable => StatusCode::SERVICE_UNAVAILABLE,
			ErrorCode::ProtocolMismatch
			| ErrorCode::MissingCookie
			| ErrorCode::InvalidCookie
			| ErrorCode::MissingAuthToken
			| ErrorCode::InvalidAuthScheme
			| ErrorCode::InvalidAuthToken
			| ErrorCode::UnknownSubdomain
			| ErrorCode::ModeMismatchInference
			| ErrorCode::ModeMismatchInteractive
			| ErrorCode::ClientIpNotAllowed => StatusCode::FORBIDDEN,
			ErrorCode::BackendDied | ErrorCode::WorkerRegistrationFailed | ErrorCode::Internal => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
		}
	}

	/// Whether the Manager may retry the same request unchanged.
	pub fn retryable(self) -> bool {
		matches!(
			self,
			ErrorCode::WorkerNotResponding
				| ErrorCode::EventNotDelivered
				| ErrorCode::SetupTimeout
				| ErrorCode::NoSlotAvailable
				| ErrorCode::NoWorkerAvailable
		)
	}
}

#[derive(Debug, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
	pub code: ErrorCode,
	pub message: String,
}

impl ApiError {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self { code, message: message.into() }
	}

	pub fn not_found(what: impl Into<String>) -> Self {
		Self::new(ErrorCode::NotFound, what.into())
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorCode::Internal, message.into())
	}
}

#[derive(Serialize)]
struct ErrorBody {
	code: &'static str,
	message: String,
	retryable: bool,
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		if self.code == ErrorCode::Internal {
			tracing::error!(error = %self.message, "internal error");
		} else {
			tracing::warn!(code = self.code.as_str(), error = %self.message, "request rejected");
		}
		let body = ErrorBody {
			code: self.code.as_str(),
			message: self.message,
			retryable: self.code.retryable(),
		};
		(self.code.status(), Json(body)).into_response()
	}
}

impl From<anyhow::Error> for ApiError {
	fn from(value: anyhow::Error) -> Self {
		ApiError::internal(value.to_string())
	}
}
