//! The admission pipeline.
//!
//! One call to [`Governor::admit`] runs every gate a model invocation must
//! pass, in order:
//!
//! 1. **Capabilities**: `use_models` and access to the requested model
//! 2. **Request rate**: minute and hour windows
//! 3. **Context**: the history window that fits the tenant's budget
//! 4. **Tokens**: reserve the context cost plus the reply reserve
//!
//! After the model call the caller reports the realized cost through
//! [`Governor::commit`], which reconciles the reservation.
//!
//! Every decision is recorded in the audit log.

use std::sync::Arc;

use promptgate_config::{AppConfig, TokenLimit};
use promptgate_context::{ContextAssembler, ContextBudget, ConversationContext, TokenCounter};
use promptgate_core::{
    Clock, Error, Message, PolicyError, Principal, QuotaError, QuotaKind, Result, StoreError,
    SystemClock,
};
use promptgate_quota::{KeySpace, QuotaLedger, RateDecision, TokenDecision, TokenUsage};
use promptgate_security::{
    AuditEvent, AuditLogger, AuditOutcome, Capabilities, Permission, PolicyStore, resolve_roles,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

/// What the caller wants to do.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub principal: &'a Principal,
    /// `provider/model` reference; the tenant default when `None`.
    pub model: Option<&'a str>,
    /// Conversation so far, oldest first, ending with the new prompt.
    pub history: &'a [Message],
    /// System prompt override; the tenant default when `None`.
    pub system_prompt: Option<&'a str>,
}

impl<'a> AdmissionRequest<'a> {
    pub fn new(principal: &'a Principal, history: &'a [Message]) -> Self {
        Self {
            principal,
            model: None,
            history,
            system_prompt: None,
        }
    }

    pub fn with_model(mut self, model: &'a str) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_system_prompt(mut self, prompt: &'a str) -> Self {
        self.system_prompt = Some(prompt);
        self
    }
}

/// A request that passed every gate.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    /// Correlates the admission with its commit in the audit log.
    pub id: Uuid,
    pub model: String,
    pub capabilities: Capabilities,
    pub context: ConversationContext,
    /// Tokens reserved against the token quota.
    pub reserved_tokens: u64,
    pub rate: RateDecision,
    pub tokens: TokenDecision,
    /// Token limit the reservation was taken under; needed by `commit`.
    pub token_limit: TokenLimit,
    pub policy_version: u64,
}

pub struct Governor {
    policies: Arc<PolicyStore>,
    ledger: QuotaLedger,
    assembler: ContextAssembler,
    audit: Arc<AuditLogger>,
    history_limit: usize,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("policy_version", &self.policies.version())
            .field("ledger", &self.ledger)
            .field("history_limit", &self.history_limit)
            .finish()
    }
}

impl Governor {
    pub fn new(
        policies: Arc<PolicyStore>,
        ledger: QuotaLedger,
        counter: Arc<TokenCounter>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            policies,
            ledger,
            assembler: ContextAssembler::new(counter, ContextBudget::default()),
            audit,
            history_limit: usize::MAX,
        }
    }

    /// Keep at most `limit` of the newest history messages before assembly.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Build a governor from configuration, opening the configured store.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn from_config_with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = promptgate_quota::open_store(&config.store).await?;
        let ledger = QuotaLedger::with_clock(store, KeySpace::new(&config.store.key_prefix), clock);
        let governor = Self {
            policies: Arc::new(PolicyStore::from_config(config)),
            ledger,
            assembler: ContextAssembler::new(
                Arc::new(TokenCounter::new()),
                ContextBudget::new(
                    config.defaults.max_context_tokens,
                    config.defaults.reserve_tokens,
                ),
            ),
            audit: Arc::new(AuditLogger::tracing()),
            history_limit: config.defaults.message_history_limit,
        };
        info!(
            store = governor.ledger.store_name(),
            tenants = config.tenants.len(),
            "Governor ready"
        );
        Ok(governor)
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// Swap in policies built from `config`. Returns the new version.
    pub fn reload(&self, config: &AppConfig) -> u64 {
        let version = self.policies.reload(config);
        self.audit.log(
            AuditEvent::PolicyReloaded { version },
            "*",
            "*",
            AuditOutcome::Allowed,
            Some(format!("{} tenants", config.tenants.len())),
        );
        version
    }

    /// Run the admission pipeline for one request.
    pub async fn admit(&self, request: AdmissionRequest<'_>) -> Result<Admission> {
        let principal = request.principal;
        let snapshot = self.policies.current();

        let Some(tenant) = snapshot.tenant(&principal.tenant) else {
            self.deny(principal, AuditEvent::TenantUnknown, None);
            return Err(PolicyError::TenantNotFound(principal.tenant.to_string()).into());
        };

        // Capabilities
        let capabilities = resolve_roles(&tenant.roles, &tenant.enabled_models, &principal.roles);
        if !capabilities.has(Permission::UseModels) {
            self.deny(
                principal,
                AuditEvent::PermissionDenied {
                    permission: Permission::UseModels.to_string(),
                },
                None,
            );
            return Err(PolicyError::PermissionDenied {
                permission: Permission::UseModels.to_string(),
            }
            .into());
        }

        let model = request.model.unwrap_or(tenant.default_model.as_str()).to_string();
        if !capabilities.can_use_model(&model) {
            self.deny(principal, AuditEvent::ModelDenied { model: model.clone() }, None);
            return Err(PolicyError::ModelNotPermitted {
                tenant: principal.tenant.to_string(),
                model,
            }
            .into());
        }

        // Request rate
        let rate = if capabilities.has(Permission::UnlimitedRate) {
            RateDecision {
                allowed: true,
                denied_by: None,
                retry_after_secs: 0,
            }
        } else {
            let limits = tenant.rate_limit_for(&principal.roles);
            self.guard_store(
                principal,
                self.ledger
                    .check_rate(&principal.tenant, &principal.id, &limits)
                    .await,
            )?
        };
        if let Some(kind) = rate.denied_by {
            return Err(self.quota_denied(principal, kind, rate.retry_after_secs));
        }

        // Context
        let budget = ContextBudget::new(tenant.max_context_tokens, tenant.reserve_tokens);
        let system_prompt = request
            .system_prompt
            .or(tenant.default_system_prompt.as_deref())
            .unwrap_or_default();
        let start = request.history.len().saturating_sub(self.history_limit);
        let context =
            self.assembler
                .build_with(&request.history[start..], system_prompt, &model, budget);

        // Tokens
        let reserved_tokens = (context.total_tokens + budget.reserve_tokens) as u64;
        let token_limit = tenant.effective_token_limit(&capabilities, &principal.roles);
        let tokens = self.guard_store(
            principal,
            self.ledger
                .check_tokens(&principal.tenant, &principal.id, &token_limit, reserved_tokens)
                .await,
        )?;
        if !tokens.allowed {
            return Err(self.quota_denied(principal, QuotaKind::Token, tokens.retry_after_secs));
        }

        let id = Uuid::new_v4();
        debug!(
            admission = %id,
            tenant = %principal.tenant,
            principal = %principal.id,
            model = %model,
            context_tokens = context.total_tokens,
            reserved_tokens,
            "Request admitted"
        );
        self.audit.log(
            AuditEvent::Admitted {
                model: model.clone(),
            },
            principal.tenant.as_str(),
            principal.id.as_str(),
            AuditOutcome::Allowed,
            Some(format!("admission {id}, reserved {reserved_tokens} tokens")),
        );

        Ok(Admission {
            id,
            model,
            capabilities,
            context,
            reserved_tokens,
            rate,
            tokens,
            token_limit,
            policy_version: snapshot.version,
        })
    }

    /// Reconcile an admission's reservation with the realized token cost.
    /// Returns the usage after reconciliation.
    pub async fn commit(
        &self,
        principal: &Principal,
        admission: &Admission,
        actual_tokens: u64,
    ) -> Result<u64> {
        let used = self.guard_store(
            principal,
            self.ledger
                .commit_tokens(
                    &principal.tenant,
                    &principal.id,
                    &admission.token_limit,
                    admission.reserved_tokens,
                    actual_tokens,
                )
                .await,
        )?;
        debug!(
            admission = %admission.id,
            reserved = admission.reserved_tokens,
            actual = actual_tokens,
            used,
            "Admission committed"
        );
        Ok(used)
    }

    /// Current token usage for `principal` under its effective limit.
    pub async fn usage(&self, principal: &Principal) -> Result<TokenUsage> {
        let snapshot = self.policies.current();
        let tenant = snapshot
            .tenant(&principal.tenant)
            .ok_or_else(|| PolicyError::TenantNotFound(principal.tenant.to_string()))?;
        let capabilities = resolve_roles(&tenant.roles, &tenant.enabled_models, &principal.roles);
        let limit = tenant.effective_token_limit(&capabilities, &principal.roles);
        Ok(self
            .ledger
            .token_usage(&principal.tenant, &principal.id, &limit)
            .await?)
    }

    fn deny(&self, principal: &Principal, event: AuditEvent, details: Option<String>) {
        self.audit.log(
            event,
            principal.tenant.as_str(),
            principal.id.as_str(),
            AuditOutcome::Denied,
            details,
        );
    }

    fn quota_denied(&self, principal: &Principal, kind: QuotaKind, retry_after_secs: u64) -> Error {
        self.deny(
            principal,
            AuditEvent::QuotaDenied { kind },
            Some(format!("retry after {retry_after_secs}s")),
        );
        QuotaError::Exceeded {
            kind,
            retry_after_secs,
        }
        .into()
    }

    fn guard_store<T>(
        &self,
        principal: &Principal,
        result: std::result::Result<T, StoreError>,
    ) -> Result<T> {
        result.map_err(|e| {
            self.audit.log(
                AuditEvent::StoreUnavailable,
                principal.tenant.as_str(),
                principal.id.as_str(),
                AuditOutcome::Failed,
                Some(e.to_string()),
            );
            Error::Store(e)
        })
    }
}
