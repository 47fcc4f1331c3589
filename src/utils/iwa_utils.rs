#![forbid(unsafe_code)]

use path_absolutize::Absolutize;
use std::ops::Deref;
use std::path::Path;
use sha2::{Digest, Sha256};

use poem::http::header::{AUTHORIZATION, PROXY_AUTHORIZATION};
use poem::Request;

use log::{debug, LevelFilter};

// ***************************************************************************
// GENERAL PUBLIC FUNCTIONS
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_absolute_path:
// ---------------------------------------------------------------------------
/** Replace tilde (~) and environment variable values in a path name and
 * then construct the absolute path name.  Unlike canonicalize, absolutize
 * does not care whether the file exists.
 *
 * On any expansion or conversion failure the original path is returned.
 */
pub fn get_absolute_path(path: &str) -> String {
    let s = match shellexpand::full(path) {
        Ok(x) => x,
        Err(_) => return path.to_owned(),
    };

    let p = Path::new(s.deref());
    let p1 = match p.absolutize() {
        Ok(x) => x,
        Err(_) => return path.to_owned(),
    };
    match p1.to_str() {
        Some(x) => x.to_owned(),
        None => path.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// hash_hex_secret:
// ---------------------------------------------------------------------------
/** Return the lowercase hex encoding of the SHA-256 digest of a secret.  Only
 * these hashes are ever written to the configuration file.
 */
pub fn hash_hex_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

// ---------------------------------------------------------------------------
// redact:
// ---------------------------------------------------------------------------
/** Keep the scheme of a URL-like value and hide the rest, so connection
 * strings can be logged without credentials.
 */
pub fn redact(value: &str) -> String {
    match value.find("://") {
        Some(pos) => format!("{}://***", &value[..pos]),
        None => "***".to_string(),
    }
}

// ---------------------------------------------------------------------------
// debug_request:
// ---------------------------------------------------------------------------
// Dump http request information to the log.  Credentials are never written.
pub fn debug_request(http_req: &Request, info: &str) {
    // Check that debug or higher logging is in effect.
    if log::max_level() < LevelFilter::Debug {
        return;
    }

    let mut s = "\n".to_string();

    let uri = http_req.uri();
    s += format!("  URI: {:?}\n", uri).as_str();

    for (name, value) in http_req.headers().iter() {
        if name == AUTHORIZATION || name == PROXY_AUTHORIZATION {
            s += format!("  Header: {} = <redacted> \n", name).as_str();
        } else {
            s += format!("  Header: {} = {:?} \n", name, value).as_str();
        }
    }

    if let Some(q) = uri.query() {
        s += format!("  Query Parameters: {:?}\n", q).as_str();
    } else {
        s += "  * No Query Parameters\n";
    }

    s += info;

    debug!("{}", s);
}
