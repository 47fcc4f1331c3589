#![forbid(unsafe_code)]

use poem_openapi::{OpenApi, payload::PlainText};

pub const GREETING: &str = "Howdy! I am a Windows Authentication test app!";

pub struct GreetingApi;

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl GreetingApi {
    /// Anonymous greeting.
    #[oai(path = "/", method = "get")]
    async fn root(&self) -> PlainText<String> {
        PlainText(GREETING.to_string())
    }
}
