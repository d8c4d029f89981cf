use std::io;

use iron::prelude::*;
use iron::status::{self, Status};

pub type Result<T> = ::std::result::Result<T, Error>;

/// Everything that can end a request early.
///
/// The `Display` text is what the operator sees in the log. Clients only
/// ever get `message()`, which never carries filesystem detail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("credentials required for realm {realm:?}")]
    Unauthorized { realm: String },
    #[error("auth type {0:?} not supported")]
    NotAcceptable(String),
    #[error("problem reading authorization")]
    Unprocessable,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn status(&self) -> Status {
        match *self {
            Error::BadRequest(_) => status::BadRequest,
            Error::Unauthorized { .. } => status::Unauthorized,
            Error::NotAcceptable(_) => status::NotAcceptable,
            Error::Unprocessable => status::UnprocessableEntity,
            Error::Forbidden(_) => status::Forbidden,
            Error::NotFound(_) => status::NotFound,
            Error::MethodNotAllowed(_) => status::MethodNotAllowed,
            Error::PreconditionFailed(_) => status::PreconditionFailed,
            Error::Internal(_) | Error::Io(_) => status::InternalServerError,
        }
    }

    /// Short message suitable for the response body.
    pub fn message(&self) -> String {
        match *self {
            Error::BadRequest(ref msg)
            | Error::Forbidden(ref msg)
            | Error::MethodNotAllowed(ref msg) => msg.clone(),
            Error::Unauthorized { .. } => "Authorization required".to_owned(),
            Error::NotAcceptable(ref scheme) => format!("Auth type {:?} not supported!", scheme),
            Error::Unprocessable => "Problem reading authorization".to_owned(),
            Error::NotFound(_) => "Not found".to_owned(),
            Error::PreconditionFailed(_) => "Backend not executable".to_owned(),
            Error::Internal(_) | Error::Io(_) => "Internal server error".to_owned(),
        }
    }
}

impl From<Error> for IronError {
    fn from(err: Error) -> IronError {
        let mut response = Response::with((err.status(), err.message()));
        if let Error::Unauthorized { ref realm } = err {
            let challenge = format!("Basic realm=\"{}\"", realm);
            response.headers.set_raw("WWW-Authenticate", vec![challenge.into_bytes()]);
        }
        IronError {
            error: Box::new(err),
            response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_stays_out_of_message() {
        let err = Error::Internal("/srv/www/secret/htpasswd unreadable".to_owned());
        assert_eq!(err.status(), status::InternalServerError);
        assert!(!err.message().contains("/srv"));

        let err = Error::NotFound("/srv/www/git/missing.git".to_owned());
        assert!(!err.message().contains("/srv"));
    }

    #[test]
    fn challenge_carries_realm() {
        let iron_err: IronError = Error::Unauthorized { realm: "Private repos".to_owned() }.into();
        assert_eq!(iron_err.response.status, Some(status::Unauthorized));
        let raw = iron_err.response.headers.get_raw("WWW-Authenticate").unwrap();
        assert_eq!(raw[0], b"Basic realm=\"Private repos\"".to_vec());
    }

    #[test]
    fn auth_failures_map_to_distinct_statuses() {
        assert_eq!(Error::NotAcceptable("Digest".into()).status(), status::NotAcceptable);
        assert_eq!(Error::Unprocessable.status(), status::UnprocessableEntity);
        assert_eq!(Error::Forbidden("no".into()).status(), status::Forbidden);
    }
}
