//! Caller identification and token issuance for registry listeners
//!
//! A request may carry nothing, an API credential (Basic or Bearer), or a
//! bearer token this server issued from `/v2/token`. Issued tokens carry
//! their own scopes and are bound to the repository whose listener issued
//! them; everything else is checked against the permission collaborator.

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::{header, HeaderMap};

use crate::auth::{
    authorize, AllowAll, AuthManager, Credentials, IssuedToken, PermissionChecker, RegistryClaims,
    RegistryTokenIssuer, Scope,
};
use crate::config::ContainerConfig;
use crate::error::RegistryError;
use crate::models::{Action, Principal, Repository};

/// Who is calling a listener
#[derive(Debug, Clone, PartialEq)]
pub enum Caller {
    Anonymous,
    /// Authenticated with an API credential
    Principal(Principal),
    /// Presented a token issued by this server
    Token(RegistryClaims),
}

impl Caller {
    /// Principal the caller acts as
    pub fn principal(&self) -> Principal {
        match self {
            Caller::Anonymous => Principal::anonymous(),
            Caller::Principal(p) => p.clone(),
            Caller::Token(claims) => Principal::named(&claims.sub),
        }
    }
}

/// Registry protocol verb for an action
pub fn scope_action(action: Action) -> &'static str {
    match action {
        Action::Read => "pull",
        Action::Write => "push",
        Action::Delete => "delete",
        Action::Admin => "*",
    }
}

fn action_for(scope_action: &str) -> Option<Action> {
    match scope_action {
        "pull" => Some(Action::Read),
        "push" => Some(Action::Write),
        "delete" => Some(Action::Delete),
        "*" => Some(Action::Admin),
        _ => None,
    }
}

/// Authentication collaborators shared by every listener
pub struct ListenerAccess {
    auth: Option<Arc<AuthManager>>,
    permissions: Arc<dyn PermissionChecker>,
    issuer: RegistryTokenIssuer,
    service: String,
}

impl ListenerAccess {
    pub fn new(
        auth: Option<Arc<AuthManager>>,
        permissions: Arc<dyn PermissionChecker>,
        issuer: RegistryTokenIssuer,
        service: impl Into<String>,
    ) -> Self {
        Self {
            auth,
            permissions,
            issuer,
            service: service.into(),
        }
    }

    /// Everyone may do everything
    pub fn open(config: &ContainerConfig) -> Self {
        Self::new(
            None,
            Arc::new(AllowAll),
            RegistryTokenIssuer::from_config(config),
            config.service_name.clone(),
        )
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Token audience for one repository's listener
    pub fn audience(&self, repo: &Repository) -> String {
        format!("{}:{}", self.service, repo.id)
    }

    fn enforced(&self) -> Option<&AuthManager> {
        self.auth.as_deref().filter(|a| a.is_enabled())
    }

    /// Identify the caller of `repo`'s listener from its Authorization header
    pub async fn identify(
        &self,
        repo: &Repository,
        headers: &HeaderMap,
        ip: Option<IpAddr>,
    ) -> Result<Caller, RegistryError> {
        let Some(auth) = self.enforced() else {
            return Ok(Caller::Anonymous);
        };
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(Caller::Anonymous);
        };

        let credentials = Credentials::parse(value)?;
        Self::resolve(auth, &self.issuer, &self.audience(repo), &credentials, ip).await
    }

    /// Identify a caller from credentials posted to the token endpoint
    pub async fn identify_credentials(
        &self,
        repo: &Repository,
        credentials: &Credentials,
        ip: Option<IpAddr>,
    ) -> Result<Caller, RegistryError> {
        match self.enforced() {
            Some(auth) => Self::resolve(auth, &self.issuer, &self.audience(repo), credentials, ip).await,
            None => Ok(Caller::Anonymous),
        }
    }

    async fn resolve(
        auth: &AuthManager,
        issuer: &RegistryTokenIssuer,
        audience: &str,
        credentials: &Credentials,
        ip: Option<IpAddr>,
    ) -> Result<Caller, RegistryError> {
        if let Credentials::Bearer(token) = credentials {
            if RegistryTokenIssuer::looks_like_jwt(token) {
                return Ok(Caller::Token(issuer.verify(token, audience)?));
            }
        }
        Ok(Caller::Principal(auth.authenticate(credentials, ip).await?))
    }

    /// Decide whether the caller may perform `action` on `image` in `repo`
    pub async fn authorize(
        &self,
        caller: &Caller,
        repo: &Repository,
        image: Option<&str>,
        action: Action,
    ) -> Result<(), RegistryError> {
        if self.enforced().is_none() {
            return Ok(());
        }
        match (caller, image) {
            (Caller::Token(claims), _) if claims.aud != self.audience(repo) => Err(
                RegistryError::Unauthorized(format!("token was not issued for '{}'", repo.name)),
            ),
            (Caller::Token(claims), Some(image)) => {
                if claims.allows(image, scope_action(action)) {
                    Ok(())
                } else {
                    Err(RegistryError::Unauthorized(format!(
                        "token does not grant {} on {}",
                        scope_action(action),
                        image
                    )))
                }
            }
            // A valid token is enough for the version check
            (Caller::Token(_), None) => Ok(()),
            (caller, _) => {
                authorize(self.permissions.as_ref(), &caller.principal(), action, Some(repo)).await
            }
        }
    }

    /// Issue a token carrying the subset of `scopes` the caller is entitled to
    pub async fn issue(
        &self,
        caller: &Caller,
        repo: &Repository,
        scopes: Vec<Scope>,
    ) -> Result<IssuedToken, RegistryError> {
        let principal = caller.principal();
        let mut granted = Vec::with_capacity(scopes.len());
        for scope in scopes {
            if scope.resource_type != "repository" {
                continue;
            }
            let mut allowed = Vec::new();
            for requested in &scope.actions {
                let Some(action) = action_for(requested) else {
                    continue;
                };
                if self.permits(&principal, repo, action).await {
                    allowed.push(requested.clone());
                }
            }
            granted.push(scope.restrict(|a| allowed.iter().any(|x| x == a)));
        }

        Ok(self.issuer.issue(&principal.name, &self.audience(repo), granted)?)
    }

    async fn permits(&self, principal: &Principal, repo: &Repository, action: Action) -> bool {
        if self.enforced().is_none() {
            return true;
        }
        authorize(self.permissions.as_ref(), principal, action, Some(repo))
            .await
            .is_ok()
    }

    /// `WWW-Authenticate` value pointing clients at this listener's token endpoint
    pub fn challenge(&self, base_url: &str, image: Option<&str>, action: Action) -> String {
        let mut value = format!(
            "Bearer realm=\"{}/v2/token\",service=\"{}\"",
            base_url.trim_end_matches('/'),
            self.service
        );
        if let Some(image) = image {
            let actions = match action {
                Action::Read => "pull".to_string(),
                other => format!("pull,{}", scope_action(other)),
            };
            value.push_str(&format!(",scope=\"repository:{}:{}\"", image, actions));
        }
        value
    }
}

impl std::fmt::Debug for ListenerAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerAccess")
            .field("enforced", &self.enforced().is_some())
            .field("service", &self.service)
            .finish()
    }
}
