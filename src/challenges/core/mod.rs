//! Core utilities shared by the pipeline, handlers, and authorization layer.

pub mod analysis;
pub mod reqwest_client;
pub mod transport;
pub mod types;

pub use analysis::{
    AuthenticateHeader, Challenge, ChallengeDetection, DEFAULT_CHALLENGE_SCHEME,
    get_authorization_scope, is_authorization_required,
};
pub use reqwest_client::ReqwestResourceTransport;
pub use transport::{RawResponse, ResourceTransport, TransportError};
pub use types::{
    AdapterInvocation, FORM_CONTENT_TYPE, RequestBuildError, ResourceRequest, ResourceResponse, encode_form,
    is_supported_method,
};
