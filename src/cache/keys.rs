//! Cache key derivation.
//!
//! Every key is a pure function of its inputs. Stale versions are never
//! deleted; they simply become unreachable once the version hash moves on.

use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

const ENVIRONMENT_ID_LEN: usize = 64;

/// Environment string for a caller: `+` marks anonymous, `-` authenticated.
pub fn environment_string(user: &str, language: &str) -> String {
    let scope = if user.is_empty() { '+' } else { '-' };
    let encoded: String = form_urlencoded::Serializer::new(String::new())
        .append_pair("user", user)
        .append_pair("lang", language)
        .finish();
    format!("{scope}{encoded}")
}

/// Keyed one-way hash of an environment string; this is both the cookie
/// value and the environment id.
pub fn compile_environment(secret: &str, environment: &str) -> String {
    let mut mac = <HmacSha256 as KeyInit>::new(&hmac_key(secret.as_bytes()));
    mac.update(environment.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Block-sized HMAC key: secrets longer than a block are hashed first, and
/// the result is zero-padded.
fn hmac_key(secret: &[u8]) -> Key<HmacSha256> {
    let mut key = Key::<HmacSha256>::default();
    if secret.len() > key.len() {
        let digest = Sha256::digest(secret);
        key[..digest.len()].copy_from_slice(&digest);
    } else {
        key[..secret.len()].copy_from_slice(secret);
    }
    key
}

/// Whether a client-supplied token has the shape of a compiled environment.
pub fn is_environment_id(token: &str) -> bool {
    token.len() == ENVIRONMENT_ID_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Environment id for a request: the cookie token when well-formed,
/// otherwise the compiled default environment.
pub fn environment_id(cookie: Option<&str>, secret: &str, default_environment: &str) -> String {
    match cookie.filter(|token| is_environment_id(token)) {
        Some(token) => token.to_string(),
        None => compile_environment(secret, default_environment),
    }
}

/// Request URI with the fragment and the ignored query parameters removed.
///
/// The remaining pairs keep their original order and encoding.
pub fn normalize_request_uri(uri: &str, ignored: &[String]) -> String {
    let uri = uri.split_once('#').map_or(uri, |(head, _)| head);
    let Some((path, query)) = uri.split_once('?') else {
        return uri.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair_key(pair);
            !ignored.iter().any(|name| *name == key)
        })
        .collect();

    if kept.is_empty() || kept.iter().all(|pair| pair.is_empty()) {
        path.to_string()
    } else {
        format!("{path}?{}", kept.join("&"))
    }
}

fn pair_key(pair: &str) -> String {
    form_urlencoded::parse(pair.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default()
}

/// Hashed page identifier for a request URI.
pub fn page_id(uri: &str, ignored: &[String]) -> String {
    hex::encode(Sha256::digest(normalize_request_uri(uri, ignored).as_bytes()))
}

/// Content entry key for `(environment, page, version)`.
pub fn page_key(prefix: &str, environment_id: &str, page_id: &str, version_hash: &str) -> String {
    format!("{prefix}/{environment_id}/{page_id}@{version_hash}")
}

pub fn app_details_key(prefix: &str, epoch: i64) -> String {
    format!("{prefix}details.app@{epoch}")
}

pub fn user_details_key(prefix: &str, environment_id: &str, epoch: i64) -> String {
    format!("{prefix}details.users.{environment_id}@{epoch}")
}

pub fn page_details_key(prefix: &str, environment_id: &str, page_id: &str, epoch: i64) -> String {
    format!("{prefix}details.pages.{environment_id}.{page_id}@{epoch}")
}

/// Rewrite ignored parameters embedded in a stored header value so they echo
/// the current request's values.
///
/// Only parameters present in `current_query` are touched.
pub fn rewrite_ignored_params(value: &str, current_query: &str, ignored: &[String]) -> String {
    let mut out = value.to_string();
    for name in ignored {
        let Some(current) = query_value(current_query, name) else {
            continue;
        };
        let encoded_key = encode_component(name);
        let encoded_pair = format!("{encoded_key}={}", encode_component(&current));
        out = replace_param(&out, &encoded_key, &encoded_pair);
    }
    out
}

/// First value of `name` in a raw query string.
pub fn query_value(query: &str, name: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn encode_component(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

fn replace_param(value: &str, encoded_key: &str, encoded_pair: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    let needle = format!("{encoded_key}=");

    loop {
        let found = rest
            .match_indices(['?', '&'])
            .map(|(idx, _)| idx)
            .find(|idx| rest[idx + 1..].starts_with(&needle));
        let Some(idx) = found else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..=idx]);
        out.push_str(encoded_pair);
        let after = &rest[idx + 1 + needle.len()..];
        let end = after.find('&').unwrap_or(after.len());
        rest = &after[end..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ignored() -> Vec<String> {
        vec!["--referrer".to_string(), "--referer".to_string()]
    }

    #[test]
    fn page_key_is_deterministic() {
        let a = page_key("p", "env", "page", "v1");
        let b = page_key("p", "env", "page", "v1");
        assert_eq!(a, b);
        assert_eq!(a, "p/env/page@v1");

        assert_ne!(a, page_key("p", "env2", "page", "v1"));
        assert_ne!(a, page_key("p", "env", "page2", "v1"));
        assert_ne!(a, page_key("p", "env", "page", "v2"));
    }

    #[test]
    fn environment_string_marks_scope() {
        assert_eq!(environment_string("", "en"), "+user=&lang=en");
        assert_eq!(environment_string("jo smith", "fr"), "-user=jo+smith&lang=fr");
    }

    #[test]
    fn compiled_environment_depends_on_secret() {
        let a = compile_environment("secret-a", "+user=&lang=en");
        let b = compile_environment("secret-b", "+user=&lang=en");
        assert_ne!(a, b);
        assert!(is_environment_id(&a));
        assert_eq!(a, compile_environment("secret-a", "+user=&lang=en"));
    }

    #[test]
    fn any_secret_length_matches_variable_key_hmac() {
        let block = "s".repeat(64);
        let long = "long".repeat(40);
        for secret in ["", "k", block.as_str(), long.as_str()] {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).unwrap();
            mac.update(b"+user=&lang=en");
            assert_eq!(
                compile_environment(secret, "+user=&lang=en"),
                hex::encode(mac.finalize().into_bytes())
            );
        }
    }

    #[test]
    fn environment_id_falls_back_to_default() {
        let default = compile_environment("k", "+user=&lang=en");
        assert_eq!(environment_id(None, "k", "+user=&lang=en"), default);
        assert_eq!(environment_id(Some("forged"), "k", "+user=&lang=en"), default);

        let token = compile_environment("k", "-user=ann&lang=en");
        assert_eq!(environment_id(Some(&token), "k", "+user=&lang=en"), token);
    }

    #[test]
    fn normalization_strips_ignored_params() {
        let ignored = ignored();
        assert_eq!(
            normalize_request_uri("/report?--referrer=/home", &ignored),
            "/report"
        );
        assert_eq!(
            normalize_request_uri("/report?a=1&--referrer=%2Fhome&b=2", &ignored),
            "/report?a=1&b=2"
        );
        assert_eq!(
            normalize_request_uri("/report?--referer=x&a=1#top", &ignored),
            "/report?a=1"
        );
        assert_eq!(normalize_request_uri("/report?", &ignored), "/report");
        assert_eq!(normalize_request_uri("/plain", &ignored), "/plain");
    }

    #[test]
    fn ignored_params_do_not_fragment_page_ids() {
        let ignored = ignored();
        assert_eq!(
            page_id("/report?--referrer=/home", &ignored),
            page_id("/report?--referrer=/elsewhere", &ignored)
        );
        assert_ne!(page_id("/report?page=1", &ignored), page_id("/report?page=2", &ignored));
    }

    #[test]
    fn details_keys_carry_epoch() {
        assert_eq!(app_details_key("p", 3), "pdetails.app@3");
        assert_eq!(user_details_key("p", "env", 3), "pdetails.users.env@3");
        assert_eq!(
            page_details_key("p", "env", "page", 3),
            "pdetails.pages.env.page@3"
        );
        assert_ne!(app_details_key("p", 3), app_details_key("p", 4));
    }

    #[test]
    fn rewrites_stored_param_with_current_value() {
        let ignored = ignored();
        let stored = "/report?-action=view&--referrer=%2Fold&x=1";
        let rewritten = rewrite_ignored_params(stored, "--referrer=%2Fnew", &ignored);
        assert_eq!(rewritten, "/report?-action=view&--referrer=%2Fnew&x=1");

        let stored = "http://example.com/r?--referrer=%2Fold";
        let rewritten = rewrite_ignored_params(stored, "--referrer=/current", &ignored);
        assert_eq!(rewritten, "http://example.com/r?--referrer=%2Fcurrent");
    }

    #[test]
    fn rewrite_leaves_values_alone_without_current_param() {
        let ignored = ignored();
        let stored = "/report?--referrer=%2Fold";
        assert_eq!(rewrite_ignored_params(stored, "a=1", &ignored), stored);
    }
}
