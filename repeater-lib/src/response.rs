use crate::executor::Protocol;
use crate::headers::Headers;
use crate::messages::ForwardResponse;

/// Result of executing a request: a response from the target, or a
/// description of why none was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        status_code: u16,
        headers: Headers,
        body: String,
    },
    Failure {
        message: String,
        error_code: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub protocol: Protocol,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(protocol: Protocol, status_code: u16, headers: Headers, body: String) -> Self {
        Self {
            protocol,
            outcome: Outcome::Success {
                status_code,
                headers,
                body,
            },
        }
    }

    pub fn failure(
        protocol: Protocol,
        message: impl Into<String>,
        error_code: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            outcome: Outcome::Failure {
                message: message.into(),
                error_code: error_code.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.outcome {
            Outcome::Success { status_code, .. } => Some(*status_code),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn headers(&self) -> Option<&Headers> {
        match &self.outcome {
            Outcome::Success { headers, .. } => Some(headers),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { body, .. } => Some(body),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Failure { error_code, .. } => Some(error_code),
            Outcome::Success { .. } => None,
        }
    }
}

impl From<Response> for ForwardResponse {
    fn from(response: Response) -> Self {
        let protocol = response.protocol.to_string();
        match response.outcome {
            Outcome::Success {
                status_code,
                headers,
                body,
            } => ForwardResponse {
                protocol,
                status_code: Some(status_code),
                error_code: None,
                message: None,
                headers: Some(headers),
                body: Some(body),
            },
            Outcome::Failure {
                message,
                error_code,
            } => ForwardResponse {
                protocol,
                status_code: None,
                error_code: Some(error_code),
                message: Some(message),
                headers: None,
                body: None,
            },
        }
    }
}
