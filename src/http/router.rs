//! Static routing table for the smart HTTP services.
//!
//! Requests are matched on method plus path suffix, so both
//! `/myapp.git/info/refs` and `/myapp/info/refs` address app `myapp`.

use std::sync::LazyLock;

use axum::http::Method;
use regex::Regex;

use crate::git::Rpc;

/// Which handler serves a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// `GET .../info/refs?service=...`: ref advertisement.
    InfoRefs,
    /// `POST .../git-<service>`: one stateless RPC exchange.
    Rpc,
}

/// One supported smart-protocol endpoint.
#[derive(Debug)]
pub struct GitService {
    pub method: Method,
    pub suffix: &'static str,
    pub handler: Handler,
    /// Fixed service for RPC endpoints; `None` when the query string names it.
    pub rpc: Option<Rpc>,
}

pub static GIT_SERVICES: [GitService; 3] = [
    GitService {
        method: Method::GET,
        suffix: "/info/refs",
        handler: Handler::InfoRefs,
        rpc: None,
    },
    GitService {
        method: Method::POST,
        suffix: "/git-upload-pack",
        handler: Handler::Rpc,
        rpc: Some(Rpc::UploadPack),
    },
    GitService {
        method: Method::POST,
        suffix: "/git-receive-pack",
        handler: Handler::Rpc,
        rpc: Some(Rpc::ReceivePack),
    },
];

/// Allowed app names: lowercase alphanumeric words joined by single dashes.
pub static APP_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z\d]+(-[a-z\d]+)*$").expect("valid app name pattern"));

/// A request matched to a service, with the app name taken from its path.
#[derive(Debug)]
pub struct Route {
    pub service: &'static GitService,
    pub app_name: String,
}

/// Match `method` and `path` against [`GIT_SERVICES`].
///
/// Returns `None` when no service matches or the app name derived from the
/// path is not allowed; both are answered with 403.
pub fn route(method: &Method, path: &str) -> Option<Route> {
    let service = GIT_SERVICES
        .iter()
        .find(|s| s.method == *method && path.ends_with(s.suffix))?;
    let app_name = app_name_from_path(path, service.suffix);
    if !APP_NAME_PATTERN.is_match(app_name) {
        return None;
    }
    Some(Route {
        service,
        app_name: app_name.to_string(),
    })
}

/// Strip `suffix`, one leading `/` and a trailing `.git` from `path`.
fn app_name_from_path<'a>(path: &'a str, suffix: &str) -> &'a str {
    let name = path.strip_suffix(suffix).unwrap_or(path);
    let name = name.strip_prefix('/').unwrap_or(name);
    name.strip_suffix(".git").unwrap_or(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(method: Method, path: &str) -> Option<(Handler, Option<Rpc>, String)> {
        route(&method, path).map(|r| (r.service.handler, r.service.rpc, r.app_name))
    }

    #[test]
    fn info_refs_with_and_without_dot_git() {
        assert_eq!(
            matched(Method::GET, "/myapp.git/info/refs"),
            Some((Handler::InfoRefs, None, "myapp".to_string()))
        );
        assert_eq!(
            matched(Method::GET, "/myapp/info/refs"),
            Some((Handler::InfoRefs, None, "myapp".to_string()))
        );
    }

    #[test]
    fn rpc_endpoints() {
        assert_eq!(
            matched(Method::POST, "/my-app.git/git-upload-pack"),
            Some((Handler::Rpc, Some(Rpc::UploadPack), "my-app".to_string()))
        );
        assert_eq!(
            matched(Method::POST, "/my-app.git/git-receive-pack"),
            Some((Handler::Rpc, Some(Rpc::ReceivePack), "my-app".to_string()))
        );
    }

    #[test]
    fn method_must_match() {
        assert!(matched(Method::POST, "/myapp.git/info/refs").is_none());
        assert!(matched(Method::GET, "/myapp.git/git-upload-pack").is_none());
        assert!(matched(Method::PUT, "/myapp.git/git-receive-pack").is_none());
    }

    #[test]
    fn unknown_suffixes_do_not_route() {
        assert!(matched(Method::GET, "/myapp.git/HEAD").is_none());
        assert!(matched(Method::GET, "/myapp.git/objects/info/packs").is_none());
        assert!(matched(Method::GET, "/").is_none());
    }

    #[test]
    fn invalid_app_names_do_not_route() {
        for path in [
            "/MyApp.git/info/refs",
            "/my_app.git/info/refs",
            "/-myapp.git/info/refs",
            "/myapp-.git/info/refs",
            "/my--app.git/info/refs",
            "/org/myapp.git/info/refs",
            "/../myapp.git/info/refs",
            "/.git/info/refs",
            "/info/refs",
        ] {
            assert!(matched(Method::GET, path).is_none(), "{path} should not route");
        }
    }

    #[test]
    fn name_derivation() {
        assert_eq!(app_name_from_path("/a.git/info/refs", "/info/refs"), "a");
        assert_eq!(app_name_from_path("/a/info/refs", "/info/refs"), "a");
        assert_eq!(app_name_from_path("//a/info/refs", "/info/refs"), "/a");
    }
}
