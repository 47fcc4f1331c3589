#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{OpenApi, payload::PlainText, ApiResponse};
use log::error;

use crate::utils::config::Config;
use crate::utils::errors::{Errors, QueryError};
use crate::utils::fixed_query::{FixedQuery, QueryOutcome};
use crate::utils::iwa_utils;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Connection string keys.
pub const MYDB_KEY          : &str = "mydb";
pub const MYDB_SQL_LOGIN_KEY: &str = "mydb-sql-login";

// Returned with 200 when MyTest is empty.
pub const EMPTY_RESULT_MSG  : &str = "Failed to read";

// ***************************************************************************
//                          Request/Response Definiions
// ***************************************************************************
pub struct SqlApi {
    mydb: FixedQuery,
    mydb_sql_login: FixedQuery,
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum SqlResponse {
    #[oai(status = 200)]
    Http200(PlainText<String>),
    #[oai(status = 500)]
    Http500(PlainText<String>),
    #[oai(status = 503)]
    Http503(PlainText<String>),
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl SqlApi {
    /// First MyTest row from the `mydb` database.
    #[oai(path = "/sql", method = "get")]
    async fn sql(&self, http_req: &Request) -> SqlResponse {
        respond(&self.mydb, http_req).await
    }

    /// First MyTest row from the `mydb-sql-login` database.
    #[oai(path = "/sql-login", method = "get")]
    async fn sql_login(&self, http_req: &Request) -> SqlResponse {
        respond(&self.mydb_sql_login, http_req).await
    }
}

impl SqlApi {
    /** Both connection strings must be configured. */
    pub fn new(config: &Config) -> Result<Self, Errors> {
        Ok(Self::from_queries(FixedQuery::new(MYDB_KEY, config)?,
                              FixedQuery::new(MYDB_SQL_LOGIN_KEY, config)?))
    }

    pub fn from_queries(mydb: FixedQuery, mydb_sql_login: FixedQuery) -> Self {
        Self { mydb, mydb_sql_login }
    }
}

// ***************************************************************************
//                          Private Functions
// ***************************************************************************
async fn respond(query: &FixedQuery, http_req: &Request) -> SqlResponse {
    iwa_utils::debug_request(http_req, &format!("  Fixed query using: {}", query.key()));

    match query.run().await {
        Ok(QueryOutcome::Row(row)) => SqlResponse::Http200(PlainText(row.to_string())),
        Ok(QueryOutcome::Empty) => SqlResponse::Http200(PlainText(EMPTY_RESULT_MSG.to_string())),
        Err(e) => {
            let msg = "ERROR: ".to_owned() + e.to_string().as_str();
            error!("{}", msg);
            error_response(&e, msg)
        }
    }
}

fn error_response(e: &QueryError, msg: String) -> SqlResponse {
    if e.is_connect() {SqlResponse::Http503(PlainText(msg))}
      else {SqlResponse::Http500(PlainText(msg))}
}
