#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{OpenApi, payload::PlainText, ApiResponse};
use log::error;

use crate::utils::authn::Principal;
use crate::utils::iwa_utils;

// ***************************************************************************
//                          Request/Response Definiions
// ***************************************************************************
pub struct IdentityApi;

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum IdentityResponse {
    #[oai(status = 200)]
    Http200(PlainText<String>),
    #[oai(status = 401)]
    Http401(PlainText<String>),
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl IdentityApi {
    /// Echo the authenticated caller.  Anonymous callers are turned away by
    /// the host authentication layer before this runs.
    #[oai(path = "/auth", method = "get")]
    async fn auth(&self, http_req: &Request) -> IdentityResponse {
        iwa_utils::debug_request(http_req, "  Identity echo request");

        match http_req.data::<Principal>() {
            Some(p) => IdentityResponse::Http200(PlainText(logged_in_msg(p))),
            None => {
                // Only reachable if the host layer was not installed.
                error!("No principal attached to {}.", http_req.uri().path());
                IdentityResponse::Http401(PlainText("ERROR: not authenticated".to_string()))
            }
        }
    }
}

fn logged_in_msg(p: &Principal) -> String {
    format!("Logged in as {} via method {}.", p.name, p.method)
}
