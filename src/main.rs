#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Result;
use log::{error, info};
use poem::listener::{Listener, RustlsCertificate, RustlsConfig};
use poem::{listener::TcpListener, Endpoint, EndpointExt, Route, Server};
use poem_openapi::OpenApiService;

// IWA Utilities
use crate::api::greeting::GreetingApi;
use crate::api::identity::IdentityApi;
use crate::api::sql::SqlApi;
use crate::api::version::VersionApi;
use crate::utils::authn::HostAuth;
use crate::utils::config::{init_runtime_context, Config, RuntimeCtx, IWA_ARGS};
use crate::utils::errors::Errors;
use crate::utils::iwa_utils::hash_hex_secret;

// Modules
mod api;
mod utils;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const SERVER_NAME : &str = "IwaServer"; // for poem logging
const IWA_VERSION : &str = env!("CARGO_PKG_VERSION");

// TLS files, relative to the certs directory.
const KEY_FILE    : &str = "/key.pem";
const CERT_FILE   : &str = "/cert.pem";

// In-flight requests get this long to finish after a shutdown request.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// main:
// ---------------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<()> {
    // Utility mode, nothing else is initialized.
    if let Some(secret) = &IWA_ARGS.hash_secret {
        println!("{}", hash_hex_secret(secret));
        return Ok(());
    }

    // --------------- Initialize IWA -----------------
    println!("Starting iwa_server!");
    let ctx = iwa_init()?;
    if ctx.iwa_args.create_dirs_only {
        info!("Data directories created under {}, exiting.", ctx.iwa_dirs.root_dir);
        return Ok(());
    }

    // --------------- Main Loop Set Up ---------------
    let config = &ctx.parms.config;
    let app = make_app(config)?;
    let addr = format!("{}{}", "0.0.0.0:", config.http_port);

    // ------------------ Main Loop -------------------
    let listener = TcpListener::bind(addr);
    if config.tls {
        let rustls = RustlsConfig::new().fallback(
            RustlsCertificate::new()
                .key(std::fs::read(ctx.iwa_dirs.certs_dir.clone() + KEY_FILE)?)
                .cert(std::fs::read(ctx.iwa_dirs.certs_dir.clone() + CERT_FILE)?),
        );
        Server::new(listener.rustls(rustls))
            .name(SERVER_NAME)
            .run_with_graceful_shutdown(app, shutdown_signal(), Some(SHUTDOWN_TIMEOUT))
            .await?;
    } else {
        Server::new(listener)
            .name(SERVER_NAME)
            .run_with_graceful_shutdown(app, shutdown_signal(), Some(SHUTDOWN_TIMEOUT))
            .await?;
    }

    info!("iwa_server stopped.");
    Ok(())
}

// ***************************************************************************
//                             Public Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// make_app:
// ---------------------------------------------------------------------------
/** Build the complete endpoint tree.  Fails if a connection string needed by
 * the fixed-query endpoints is not configured.
 */
pub fn make_app(config: &Config) -> Result<impl Endpoint> {
    let sql_api = SqlApi::new(config)?;
    Ok(build_app(config, sql_api))
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// iwa_init:
// ---------------------------------------------------------------------------
/** Initialize the data directories, logging and configuration, then log what
 * we are running with.
 */
fn iwa_init() -> Result<RuntimeCtx> {
    let ctx = init_runtime_context()?;
    info!("{}", Errors::InputParms(format!("{:#?}", ctx)));
    print_version_info();
    Ok(ctx)
}

// ---------------------------------------------------------------------------
// build_app:
// ---------------------------------------------------------------------------
fn build_app(config: &Config, sql_api: SqlApi) -> impl Endpoint {
    let iwa_url = format!("{}:{}", config.http_addr, config.http_port);

    let endpoints = (GreetingApi, IdentityApi, sql_api, VersionApi);
    let api_service =
        OpenApiService::new(endpoints, config.title.clone(), IWA_VERSION).server(iwa_url);

    // Allow the generated openapi specs to be retrieved from the server.
    let spec = api_service.spec_endpoint();
    let spec_yaml = api_service.spec_endpoint_yaml();
    let ui = api_service.swagger_ui();

    Route::new()
        .nest("/docs", ui)
        .at("/spec", spec)
        .at("/spec_yaml", spec_yaml)
        .nest("/", api_service)
        .with(HostAuth::from_config(&config.auth, &config.title))
}

// ---------------------------------------------------------------------------
// shutdown_signal:
// ---------------------------------------------------------------------------
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for the shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, draining requests.");
}

// ---------------------------------------------------------------------------
// print_version_info:
// ---------------------------------------------------------------------------
fn print_version_info() {
    info!("\n*** Running IWA={}, BRANCH={}, COMMIT={}, DIRTY={}, SRC_TS={}, RUSTC={}",
          IWA_VERSION,
          env!("GIT_BRANCH"),
          env!("GIT_COMMIT_SHORT"),
          env!("GIT_DIRTY"),
          env!("SOURCE_TIMESTAMP"),
          env!("RUSTC_VERSION"));
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use poem::http::StatusCode;
    use poem::test::TestClient;

    use crate::api::greeting::GREETING;
    use crate::api::sql::{EMPTY_RESULT_MSG, MYDB_KEY, MYDB_SQL_LOGIN_KEY};
    use crate::utils::config::{BasicUser, ConnectionString, TrustedHeaderConfig};
    use crate::utils::fixed_query::{tests::TestDb, FixedQuery};

    fn test_config(mydb: &TestDb, login: &TestDb) -> Config {
        let mut config = Config::new();
        config.title = "Test".to_string();
        config.tls = false;
        config.connection_strings.insert(MYDB_KEY.to_string(), ConnectionString::new(mydb.url()));
        config.connection_strings.insert(MYDB_SQL_LOGIN_KEY.to_string(), ConnectionString::new(login.url()));
        config.auth.trusted_header = Some(TrustedHeaderConfig::default());
        config.auth.users.push(BasicUser {
            name: "bob".to_string(),
            secret_hash: hash_hex_secret("secret"),
        });
        config
    }

    #[tokio::test]
    async fn greeting_is_anonymous() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let cli = TestClient::new(make_app(&test_config(&mydb, &login)).unwrap());

        let resp = cli.get("/").send().await;
        resp.assert_status_is_ok();
        resp.assert_text(GREETING).await;
    }

    #[tokio::test]
    async fn auth_requires_credentials() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let cli = TestClient::new(make_app(&test_config(&mydb, &login)).unwrap());

        let resp = cli.get("/auth").send().await;
        resp.assert_status(StatusCode::UNAUTHORIZED);
        resp.assert_header("www-authenticate", "Negotiate");
    }

    #[tokio::test]
    async fn auth_echoes_negotiated_principal() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let cli = TestClient::new(make_app(&test_config(&mydb, &login)).unwrap());

        let resp = cli.get("/auth")
            .header("X-Remote-User", "alice")
            .header("X-Remote-Auth-Type", "Negotiate")
            .send()
            .await;
        resp.assert_status_is_ok();
        resp.assert_text("Logged in as alice via method Negotiate.").await;
    }

    #[tokio::test]
    async fn auth_with_basic_credentials() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let cli = TestClient::new(make_app(&test_config(&mydb, &login)).unwrap());

        let resp = cli.get("/auth")
            .header("Authorization", "Basic Ym9iOnNlY3JldA==")
            .send()
            .await;
        resp.assert_status_is_ok();
        resp.assert_text("Logged in as bob via method Basic.").await;

        let resp = cli.get("/auth")
            .header("Authorization", "Basic Ym9iOndyb25n")
            .send()
            .await;
        resp.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bad_credentials_do_not_block_anonymous_paths() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let cli = TestClient::new(make_app(&test_config(&mydb, &login)).unwrap());

        let resp = cli.get("/")
            .header("Authorization", "Basic Ym9iOndyb25n")
            .send()
            .await;
        resp.assert_status_is_ok();
    }

    #[tokio::test]
    async fn sql_returns_first_row() {
        let mydb = TestDb::new(&[("Bob", 30)]).await;
        let login = TestDb::new(&[("Carol", 41)]).await;
        let cli = TestClient::new(make_app(&test_config(&mydb, &login)).unwrap());

        let resp = cli.get("/sql").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("Bob, 30").await;

        let resp = cli.get("/sql-login").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("Carol, 41").await;
    }

    #[tokio::test]
    async fn sql_empty_table_is_failed_to_read() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let cli = TestClient::new(make_app(&test_config(&mydb, &login)).unwrap());

        for _ in 0..3 {
            let resp = cli.get("/sql").send().await;
            resp.assert_status_is_ok();
            resp.assert_text(EMPTY_RESULT_MSG).await;
        }
    }

    #[tokio::test]
    async fn connections_are_released_on_every_path() {
        let mydb = TestDb::new(&[("Bob", 30)]).await;
        let login = TestDb::new(&[]).await;
        let config = test_config(&mydb, &login);
        let q1 = FixedQuery::new(MYDB_KEY, &config).unwrap();
        let q2 = FixedQuery::new(MYDB_SQL_LOGIN_KEY, &config).unwrap();
        let app = build_app(&config, SqlApi::from_queries(q1.clone(), q2.clone()));
        let cli = TestClient::new(app);

        for _ in 0..4 {
            cli.get("/sql").send().await.assert_status_is_ok();
            cli.get("/sql-login").send().await.assert_status_is_ok();
        }
        assert_eq!(q1.tally().opened(), 4);
        assert_eq!(q1.tally().released(), 4);
        assert_eq!(q2.tally().opened(), 4);
        assert_eq!(q2.tally().released(), 4);
    }

    #[tokio::test]
    async fn sql_query_error_is_500() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let mut config = test_config(&mydb, &login);
        // An empty database file has no MyTest table.
        let bare = std::env::temp_dir().join(format!("iwa-bare-{}.db", std::process::id()));
        config.connection_strings.insert(MYDB_KEY.to_string(),
            ConnectionString::new(format!("sqlite://{}?mode=rwc", bare.display())));
        let cli = TestClient::new(make_app(&config).unwrap());

        let resp = cli.get("/sql").send().await;
        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let _ = std::fs::remove_file(&bare);
    }

    #[tokio::test]
    async fn sql_connect_error_is_503() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let mut config = test_config(&mydb, &login);
        let missing = std::env::temp_dir().join("iwa-no-such-dir").join("missing.db");
        config.connection_strings.insert(MYDB_SQL_LOGIN_KEY.to_string(),
            ConnectionString::new(format!("sqlite://{}?mode=ro", missing.display())));
        let cli = TestClient::new(make_app(&config).unwrap());

        let resp = cli.get("/sql-login").send().await;
        resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn missing_connection_string_fails_startup() {
        let mut config = Config::new();
        config.connection_strings.insert(MYDB_KEY.to_string(), ConnectionString::new("sqlite://x.db"));
        assert!(make_app(&config).is_err());
    }

    #[tokio::test]
    async fn version_and_spec_are_served() {
        let (mydb, login) = (TestDb::new(&[]).await, TestDb::new(&[]).await);
        let cli = TestClient::new(make_app(&test_config(&mydb, &login)).unwrap());

        let resp = cli.get("/version").send().await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        json.value().object().get("result_code").assert_string("0");

        cli.get("/spec").send().await.assert_status_is_ok();
    }
}
