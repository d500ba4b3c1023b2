//! Trigger declarations: how a pipeline run gets started.
//!
//! Triggers are declared on the pipeline definition and consumed at
//! trigger-evaluation time by the transport layer; the execution core only
//! validates their shape. Secret material is never embedded — only an
//! opaque `secret_code` reference resolved by an external collaborator.

use serde::{Deserialize, Serialize};

/// Authentication scheme for webhook triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookAuthKind {
    #[default]
    None,
    ApiKey,
    Hmac,
    Basic,
    Jwt,
}

/// Digest used by HMAC webhook signatures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HmacAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

/// How a pipeline run is initiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Trigger {
    /// Started explicitly by an operator or API call.
    Manual,
    /// Started on a cron schedule (5- or 6-field expression).
    Schedule { cron: String },
    /// Started by an inbound HTTP request on `path`.
    Webhook {
        path: String,
        #[serde(default)]
        authentication: WebhookAuthKind,
        /// Header carrying the credential (API key or bearer token).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        /// Header carrying the HMAC signature.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature_header: Option<String>,
        #[serde(default)]
        algorithm: HmacAlgorithm,
        /// Opaque reference into the external secret store.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_code: Option<String>,
    },
    /// Started when a domain event of `event_type` is published.
    Event { event_type: String },
}

impl Trigger {
    /// Webhook triggers with an auth scheme other than NONE must carry a
    /// secret reference; used by definition validation.
    #[must_use]
    pub fn requires_secret(&self) -> bool {
        matches!(
            self,
            Self::Webhook {
                authentication,
                secret_code: None,
                ..
            } if *authentication != WebhookAuthKind::None
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_tagged_serde_roundtrip() {
        let trigger: Trigger = serde_json::from_value(json!({
            "type": "WEBHOOK",
            "path": "/hooks/orders",
            "authentication": "HMAC",
            "signatureHeader": "x-hub-signature-256",
            "algorithm": "SHA256",
            "secretCode": "orders-webhook"
        }))
        .unwrap();
        match &trigger {
            Trigger::Webhook {
                authentication,
                signature_header,
                secret_code,
                ..
            } => {
                assert_eq!(*authentication, WebhookAuthKind::Hmac);
                assert_eq!(signature_header.as_deref(), Some("x-hub-signature-256"));
                assert_eq!(secret_code.as_deref(), Some("orders-webhook"));
            }
            other => panic!("unexpected trigger: {other:?}"),
        }
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["type"], "WEBHOOK");
    }

    #[test]
    fn schedule_trigger_parses() {
        let trigger: Trigger =
            serde_json::from_value(json!({"type": "SCHEDULE", "cron": "0 3 * * *"})).unwrap();
        assert_eq!(
            trigger,
            Trigger::Schedule {
                cron: "0 3 * * *".into()
            }
        );
    }

    #[test]
    fn requires_secret_only_for_authenticated_webhooks() {
        let open = Trigger::Webhook {
            path: "/open".into(),
            authentication: WebhookAuthKind::None,
            header: None,
            signature_header: None,
            algorithm: HmacAlgorithm::Sha256,
            secret_code: None,
        };
        assert!(!open.requires_secret());

        let keyed = Trigger::Webhook {
            path: "/keyed".into(),
            authentication: WebhookAuthKind::ApiKey,
            header: Some("x-api-key".into()),
            signature_header: None,
            algorithm: HmacAlgorithm::Sha256,
            secret_code: None,
        };
        assert!(keyed.requires_secret());
        assert!(!Trigger::Manual.requires_secret());
    }
}
