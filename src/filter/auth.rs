//! JWT user authentication.

use super::{Filter, USER_AUTH_FILTER_ID, USER_AUTH_FILTER_ORDER};
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashSet;

/// Cookie read when the rule does not name one.
pub const DEFAULT_COOKIE: &str = "user-jwt";

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Validates the HS256 token in the user cookie and forwards the user id.
///
/// Only active for rules carrying a `user_auth_filter` config, whose JSON may
/// set `secret` and `cookie`.
#[derive(Debug, Default)]
pub struct UserAuthFilter;

impl UserAuthFilter {
    fn parse_user_id(token: &str, secret: &str) -> std::result::Result<i64, String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
            .map_err(|e| e.to_string())?;
        data.claims.sub.parse::<i64>().map_err(|e| e.to_string())
    }
}

impl Filter for UserAuthFilter {
    fn id(&self) -> &'static str {
        USER_AUTH_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "user auth filter"
    }

    fn order(&self) -> i32 {
        USER_AUTH_FILTER_ORDER
    }

    fn do_filter(&self, ctx: &mut GatewayContext) -> Result<()> {
        let Some(config) = ctx.rule().filter_config(USER_AUTH_FILTER_ID) else {
            return Ok(());
        };
        let secret = config.str_setting("secret").unwrap_or_default().to_string();
        let cookie = config.str_setting("cookie").unwrap_or(DEFAULT_COOKIE).to_string();

        let token = match ctx.request().cookie(&cookie) {
            Some(token) if !token.trim().is_empty() => token.to_string(),
            _ => {
                return Err(GatewayError::Unauthorized {
                    reason: format!("missing {} cookie", cookie),
                })
            }
        };

        let user_id = Self::parse_user_id(&token, &secret)
            .map_err(|reason| GatewayError::Unauthorized { reason })?;
        ctx.request_mut().set_user_id(user_id);
        Ok(())
    }
}
