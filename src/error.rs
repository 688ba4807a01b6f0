//
// Error generator macro
//
use std::error::Error as StdError;

macro_rules! make_error {
    ( $( $name:ident ( $ty:ty ): $src_fn:expr, $usr_msg_fun:expr ),+ $(,)? ) => {
        const BAD_REQUEST: u16 = 400;

        pub enum ErrorKind { $($name( $ty )),+ }

        pub struct Error {
            message: String,
            error: ErrorKind,
            error_code: u16,
            oauth_code: Option<&'static str>,
        }

        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self { Error::from((stringify!($name), err)) }
        })+
        $(impl<S: Into<String>> From<(S, $ty)> for Error {
            fn from(val: (S, $ty)) -> Self {
                Error {
                    message: val.0.into(),
                    error: ErrorKind::$name(val.1),
                    error_code: BAD_REQUEST,
                    oauth_code: None,
                }
            }
        })+
        impl StdError for Error {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                match &self.error {$( ErrorKind::$name(e) => $src_fn(e), )+}
            }
        }
        impl std::fmt::Display for Error {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match &self.error {$(
                   ErrorKind::$name(e) => {
                        let msg = $usr_msg_fun(e, &self.message);
                        write!(f, "{msg}")
                   },
                )+}
            }
        }
    };
}

use diesel::r2d2::PoolError as R2d2Err;
use diesel::result::Error as DieselErr;
use diesel::ConnectionError as DieselConnErr;
use jsonwebtoken::errors::Error as JwtErr;
use openssl::error::ErrorStack as SslErr;
use reqwest::Error as ReqErr;
use rocket::error::Error as RocketErr;
use serde_json::Error as SerdeErr;
use std::io::Error as IoErr;

// Error struct
// Contains a String error message, meant for the user, and an enum variant with the source error.
//
// After the variant itself there are two expressions. The first one indicates whether the
// source error is exposed through `StdError::source` (and thus pretty-printed to the log).
// The second one contains the function used to render the error for `Display`.
make_error! {
    // Used to represent err! calls
    Simple(String):  _no_source, _api_error,

    Db(DieselErr):   _has_source, _api_error,
    DbConn(DieselConnErr): _has_source, _api_error,
    R2d2(R2d2Err):   _has_source, _api_error,
    Serde(SerdeErr): _has_source, _api_error,
    Jwt(JwtErr):     _has_source, _api_error,
    Io(IoErr):       _has_source, _api_error,
    Req(ReqErr):     _has_source, _api_error,
    Ssl(SslErr):     _has_source, _api_error,
    Rocket(RocketErr): _has_source, _api_error,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source() {
            Some(e) => write!(f, "{}.\n[CAUSE] {:#?}", self.message, e),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Error {
    pub fn new<M: Into<String>, N: Into<String>>(usr_msg: M, log_msg: N) -> Self {
        (usr_msg, log_msg.into()).into()
    }

    #[must_use]
    pub fn with_msg<M: Into<String>>(mut self, msg: M) -> Self {
        self.message = msg.into();
        self
    }

    #[must_use]
    pub const fn with_code(mut self, code: u16) -> Self {
        self.error_code = code;
        self
    }

    /// Overrides the canonical `error` member of the JSON body ("code_expired",
    /// "unsupported_grant_type", ...). Without it the code is derived from the
    /// HTTP status, so credential failures all look like `invalid_grant`.
    #[must_use]
    pub const fn with_oauth_code(mut self, code: &'static str) -> Self {
        self.oauth_code = Some(code);
        self
    }

    pub fn get_code(&self) -> u16 {
        self.error_code
    }
}

pub trait MapResult<S> {
    fn map_res(self, msg: &str) -> Result<S, Error>;
}

impl<S, E: Into<Error>> MapResult<S> for Result<S, E> {
    fn map_res(self, msg: &str) -> Result<S, Error> {
        self.map_err(|e| e.into().with_msg(msg))
    }
}

impl<E: Into<Error>> MapResult<()> for Result<usize, E> {
    fn map_res(self, msg: &str) -> Result<(), Error> {
        self.and(Ok(())).map_res(msg)
    }
}

impl<S> MapResult<S> for Option<S> {
    fn map_res(self, msg: &str) -> Result<S, Error> {
        self.ok_or_else(|| Error::new(msg, ""))
    }
}

#[allow(clippy::unnecessary_wraps)]
const fn _has_source<T>(e: T) -> Option<T> {
    Some(e)
}
fn _no_source<T, S>(_: T) -> Option<S> {
    None
}

// All client-facing errors share one body shape, so that a failing credential
// never reveals which internal check rejected it.
fn _api_error(_: &impl std::any::Any, msg: &str) -> String {
    serde_json::to_string(&serde_json::json!({
        "error": "invalid_request",
        "error_description": msg,
    }))
    .unwrap()
}

//
// Rocket responder impl
//
use std::io::Cursor;

use rocket::{
    http::{ContentType, Status},
    request::Request,
    response::{self, Responder, Response},
};

impl Responder<'_, 'static> for Error {
    fn respond_to(self, _: &Request<'_>) -> response::Result<'static> {
        match self.error {
            ErrorKind::Simple(_) => {} // Already logged at the `err!` site
            _ => error!(target: "error", "{:#?}", self),
        };

        let code = Status::from_code(self.error_code).unwrap_or(Status::BadRequest);
        let generic = match code.code {
            401 => "invalid_grant",
            403 => "unauthorized",
            502 => "upstream_unavailable",
            500 => "server_error",
            _ => "invalid_request",
        };
        let body = serde_json::to_string(&serde_json::json!({
            "error": self.oauth_code.unwrap_or(generic),
            "error_description": self.message,
        }))
        .unwrap();
        Response::build().status(code).header(ContentType::JSON).sized_body(Some(body.len()), Cursor::new(body)).ok()
    }
}

//
// Error return macros
//
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        error!("{}", $msg);
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        error!("{}. {}", $usr_msg, $log_value);
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[macro_export]
macro_rules! err_silent {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[macro_export]
macro_rules! err_code {
    ($msg:expr, $err_code:expr) => {{
        error!("{}", $msg);
        return Err($crate::error::Error::new($msg, $msg).with_code($err_code));
    }};
    ($usr_msg:expr, $log_value:expr, $err_code:expr) => {{
        error!("{}. {}", $usr_msg, $log_value);
        return Err($crate::error::Error::new($usr_msg, $log_value).with_code($err_code));
    }};
}

/// Rejections whose JSON body must carry a specific canonical code from the
/// endpoint table ("code_expired", "unsupported_grant_type", ...).
#[macro_export]
macro_rules! err_oauth {
    ($oauth_code:expr, $msg:expr) => {{
        error!("{}: {}", $oauth_code, $msg);
        return Err($crate::error::Error::new($msg, $msg).with_oauth_code($oauth_code));
    }};
    ($oauth_code:expr, $msg:expr, $err_code:expr) => {{
        error!("{}: {}", $oauth_code, $msg);
        return Err($crate::error::Error::new($msg, $msg).with_code($err_code).with_oauth_code($oauth_code));
    }};
}

#[macro_export]
macro_rules! err_handler {
    ($expr:expr) => {{
        error!(target: "auth", "Unauthorized Error: {}", $expr);
        return ::rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, $expr));
    }};
}
