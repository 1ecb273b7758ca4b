use crate::constants;
use crate::error::{ProxyError, ProxyResult};
use base64::Engine as _;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use sha2::Digest;

fn client_id() -> ProxyResult<String> {
    std::env::var("VIADUCT_OAUTH_CLIENT_ID")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ProxyError::AuthInvalid("missing OAuth client id (set VIADUCT_OAUTH_CLIENT_ID)".into())
        })
}

fn client_secret() -> Option<String> {
    std::env::var("VIADUCT_OAUTH_CLIENT_SECRET")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn generate_pkce_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn pkce_challenge_s256(verifier: &str) -> String {
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

pub fn build_auth_url(redirect_uri: &str, state: &str, code_challenge: &str) -> ProxyResult<String> {
    let cid = client_id()?;
    let params = [
        ("client_id", cid.as_str()),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("scope", constants::OAUTH_SCOPES),
        ("access_type", "offline"),
        ("prompt", "consent"),
        ("state", state),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
    ];
    let url = url::Url::parse_with_params(constants::OAUTH_AUTH_URL, &params)
        .map_err(|e| ProxyError::Unknown(format!("invalid auth url: {}", e)))?;
    Ok(url.to_string())
}

pub async fn exchange_code(
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> ProxyResult<TokenResponse> {
    let cid = client_id()?;
    let mut params: Vec<(&str, String)> = vec![
        ("client_id", cid),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
        ("grant_type", "authorization_code".to_string()),
        ("code_verifier", code_verifier.to_string()),
    ];
    if let Some(secret) = client_secret() {
        params.push(("client_secret", secret));
    }
    post_token_form(&params).await
}

// Refresh-token grant. A 400 carrying invalid_grant means the refresh token
// was revoked; the caller marks the account invalid.
pub async fn refresh_access_token(refresh_token: &str) -> ProxyResult<TokenResponse> {
    let cid = client_id()?;
    let mut params: Vec<(&str, String)> = vec![
        ("client_id", cid),
        ("refresh_token", refresh_token.to_string()),
        ("grant_type", "refresh_token".to_string()),
    ];
    if let Some(secret) = client_secret() {
        params.push(("client_secret", secret));
    }
    post_token_form(&params).await
}

async fn post_token_form(params: &[(&str, String)]) -> ProxyResult<TokenResponse> {
    let client = crate::utils::http::get_client();
    let response = client
        .post(constants::OAUTH_TOKEN_URL)
        .form(params)
        .send()
        .await
        .map_err(|e| ProxyError::Transient(format!("token endpoint unreachable: {}", e)))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ProxyError::Transient(format!("token response parse failed: {}", e)));
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 400 && body.contains("invalid_grant") {
        return Err(ProxyError::AuthInvalid(
            "refresh token rejected (invalid_grant)".into(),
        ));
    }
    if status.is_server_error() {
        return Err(ProxyError::Transient(format!(
            "token endpoint returned {}",
            status
        )));
    }
    Err(ProxyError::AuthInvalid(format!(
        "token grant failed ({}): {}",
        status, body
    )))
}

pub async fn fetch_user_info(access_token: &str) -> ProxyResult<UserInfo> {
    let client = crate::utils::http::get_client();
    let response = client
        .get(constants::OAUTH_USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| ProxyError::Transient(format!("userinfo request failed: {}", e)))?;
    if !response.status().is_success() {
        return Err(ProxyError::AuthInvalid(format!(
            "userinfo returned {}",
            response.status()
        )));
    }
    response
        .json::<UserInfo>()
        .await
        .map_err(|e| ProxyError::Transient(format!("userinfo parse failed: {}", e)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCode {
    pub code: String,
    pub state: Option<String>,
}

// Accepts whatever the user pastes after the consent screen: the full
// redirect URL or the bare authorization code.
pub fn extract_authorization_code(input: &str) -> ProxyResult<ExtractedCode> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ProxyError::BadRequest("authorization code is empty".into()));
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let parsed = url::Url::parse(trimmed)
            .map_err(|e| ProxyError::BadRequest(format!("unparsable redirect URL: {}", e)))?;
        let mut code = None;
        let mut state = None;
        let mut oauth_error = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => oauth_error = Some(value.into_owned()),
                _ => {}
            }
        }
        if let Some(error) = oauth_error {
            return Err(ProxyError::BadRequest(format!("OAuth error: {}", error)));
        }
        let code = code.ok_or_else(|| {
            ProxyError::BadRequest("redirect URL is missing the code parameter".into())
        })?;
        return Ok(ExtractedCode { code, state });
    }

    if trimmed.len() < 10 {
        return Err(ProxyError::BadRequest(
            "authorization code is too short".into(),
        ));
    }
    let decoded = percent_decode_str(trimmed)
        .decode_utf8()
        .map_err(|_| ProxyError::BadRequest("authorization code is not valid UTF-8".into()))?
        .into_owned();
    Ok(ExtractedCode {
        code: decoded,
        state: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_matches_rfc_shape() {
        let verifier = generate_pkce_verifier();
        assert!(verifier.len() >= 43);
        let challenge = pkce_challenge_s256(&verifier);
        assert!(!challenge.contains('='));
        assert!(!challenge.contains('+'));
        // Deterministic for a fixed verifier.
        assert_eq!(challenge, pkce_challenge_s256(&verifier));
    }

    #[test]
    fn extracts_code_and_state_from_redirect_url() {
        let extracted = extract_authorization_code(
            "http://localhost:51121/oauth-callback?code=4/0AQSTg123&state=abc123",
        )
        .unwrap();
        assert_eq!(extracted.code, "4/0AQSTg123");
        assert_eq!(extracted.state.as_deref(), Some("abc123"));
    }

    #[test]
    fn raw_code_is_trimmed() {
        let extracted = extract_authorization_code("  4/0AQSTgQGcode123  \n").unwrap();
        assert_eq!(extracted.code, "4/0AQSTgQGcode123");
        assert_eq!(extracted.state, None);
    }

    #[test]
    fn redirect_with_error_param_is_rejected() {
        let err =
            extract_authorization_code("http://localhost:51121/?error=access_denied").unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(msg) if msg.contains("OAuth error")));
    }

    #[test]
    fn short_raw_code_is_rejected() {
        let err = extract_authorization_code("abc").unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(msg) if msg.contains("too short")));
    }

    #[test]
    fn redirect_without_code_is_rejected() {
        let err = extract_authorization_code("http://localhost:51121/?state=abc").unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(msg) if msg.contains("missing the code")));
    }

    #[test]
    fn url_encoded_codes_are_decoded() {
        let from_url =
            extract_authorization_code("http://localhost:51121/cb?code=4%2F0AQSTg123").unwrap();
        assert_eq!(from_url.code, "4/0AQSTg123");
        let raw = extract_authorization_code("4%2F0AQSTgQGcode").unwrap();
        assert_eq!(raw.code, "4/0AQSTgQGcode");
    }
}
