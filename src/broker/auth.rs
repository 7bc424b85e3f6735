use async_trait::async_trait;
use subtle::ConstantTimeEq;

use rmqtt::hook::{Handler, HookResult, Parameter, ReturnType};
use rmqtt::types::{AuthResult, PublishAclResult, SubscribeAclResult};

/// CONNECT authentication and ACL. A client is accepted when either its
/// username or its password equals the configured token; authenticated
/// clients may publish and subscribe anywhere.
#[derive(Clone)]
pub(crate) struct AuthHandler {
    token: String,
}

impl AuthHandler {
    pub(crate) fn new(token: String) -> Self {
        Self { token }
    }

    fn token_matches(&self, candidate: Option<&[u8]>) -> bool {
        match candidate {
            Some(bytes) => bytes.ct_eq(self.token.as_bytes()).into(),
            None => false,
        }
    }
}

#[async_trait]
impl Handler for AuthHandler {
    async fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType {
        match param {
            Parameter::ClientAuthenticate(connect_info) => {
                let by_username =
                    self.token_matches(connect_info.username().map(|u| u.as_bytes().as_ref()));
                let by_password =
                    self.token_matches(connect_info.password().map(|p| p.as_ref()));

                if by_username || by_password {
                    log::debug!("{:?} mqtt authenticate ok", connect_info.id());
                    return (false, Some(HookResult::AuthResult(AuthResult::Allow(false, None))));
                }

                log::warn!(
                    "{:?} mqtt authenticate failed, username: {:?}",
                    connect_info.id(),
                    connect_info.username()
                );
                (false, Some(HookResult::AuthResult(AuthResult::BadUsernameOrPassword)))
            }
            Parameter::ClientSubscribeCheckAcl(_session, subscribe) => (
                false,
                Some(HookResult::SubscribeAclResult(SubscribeAclResult::new_success(
                    subscribe.opts.qos(),
                    None,
                ))),
            ),
            Parameter::MessagePublishCheckAcl(_session, _publish) => {
                (false, Some(HookResult::PublishAclResult(PublishAclResult::Allow)))
            }
            _ => (true, acc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_match_is_exact() {
        let h = AuthHandler::new("secret-token".into());
        assert!(h.token_matches(Some(b"secret-token")));
        assert!(!h.token_matches(Some(b"secret-toke")));
        assert!(!h.token_matches(Some(b"secret-token-x")));
        assert!(!h.token_matches(Some(b"")));
        assert!(!h.token_matches(None));
    }
}
