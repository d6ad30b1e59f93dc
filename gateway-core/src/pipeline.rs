//! Pipeline orchestration: resolve → evidence → policy → selector → llm
//! → validate → assemble → persist, tying every stage module together
//! into the single entrypoint `gatewayd`'s HTTP handler calls.

use std::collections::BTreeMap;
use std::time::Instant;

use gateway_clients::{Cache, LlmClient, MemoryClient, ObjectStore, PolicyClient};
use gateway_spec::{fingerprint, FallbackReason, PolicyIdentity, Response};

use crate::assembler::{self, AssemblyInput};
use crate::config::Config;
use crate::error::GatewayError;
use crate::evidence::{self, EvidenceContext};
use crate::llm_invoke;
use crate::persister::{self, Artefacts};
use crate::policy_gate;
use crate::resolver::{self, ResolveInput};
use crate::selector;
use crate::signer::Signer;
use crate::templater::TemplateRegistry;
use crate::validator;

/// The collaborators a single request needs. Borrowed rather than
/// owned: `gatewayd` builds these once at startup and shares them across
/// every request via `axum::extract::State`.
pub struct PipelineDeps<'a> {
    /// Memory-graph service client.
    pub memory: &'a dyn MemoryClient,
    /// Policy-decision service client.
    pub policy: &'a dyn PolicyClient,
    /// Evidence-bundle cache.
    pub cache: &'a dyn Cache,
    /// LLM backend (or the disabled stub, per `OPENAI_DISABLED`).
    pub llm: &'a dyn LlmClient,
    /// Audit-artefact object store.
    pub object_store: &'a dyn ObjectStore,
    /// Response signer.
    pub signer: &'a Signer,
    /// Templater fallback registry.
    pub templates: &'a TemplateRegistry,
    /// Process-scope configuration.
    pub config: &'a Config,
}

/// A single why-decision question.
#[derive(Debug, Clone)]
pub struct AskRequest {
    /// Caller-assigned (or gateway-generated) request id; also the
    /// artefact-persistence prefix.
    pub request_id: String,
    /// Already-canonical anchor id, when the caller has one.
    pub anchor_id: Option<String>,
    /// An alias for an anchor id, consulted only when `anchor_id` is
    /// absent.
    pub decision_ref: Option<String>,
    /// The free-text question, also used as the resolver's fallback
    /// query when neither id field is present.
    pub question: String,
    /// Caller identity forwarded to the policy service.
    pub identity: PolicyIdentity,
    /// Forwarded request headers relevant to policy evaluation.
    pub headers: BTreeMap<String, String>,
    /// `(id, text)` pairs the resolver's local fallback scorer may use
    /// when the upstream resolve call misses or errors.
    pub candidates: Vec<(String, String)>,
    /// Mirrored into `meta.load_shed`; the caller (the HTTP layer)
    /// decides whether to even dispatch the request when this is set.
    pub load_shed: bool,
}

fn resolve_input(req: &AskRequest) -> ResolveInput<'_> {
    if let Some(id) = &req.anchor_id {
        ResolveInput::AnchorId(id)
    } else if let Some(r) = &req.decision_ref {
        ResolveInput::DecisionRef(r)
    } else {
        ResolveInput::Text(&req.question)
    }
}

/// Run the full pipeline for `req`, returning the signed, audited
/// response. Every artefact is persisted before this returns (subject to
/// `DISABLE_ARTEFACT_WRITES`/`ARTIFACT_STRICT`).
///
/// # Errors
/// Propagates any stage's `GatewayError` unchanged: `UpstreamError`/
/// `UpstreamTimeout` from the resolver or evidence builder,
/// `PolicyDeny`/`PolicyError` from the policy gate, `StorageUnavailable`
/// from the persister under `ARTIFACT_STRICT=1`.
pub async fn run_ask(req: AskRequest, deps: &PipelineDeps<'_>) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let config = deps.config;

    let anchor_id = resolver::resolve(
        deps.memory,
        resolve_input(&req),
        Some(req.candidates.as_slice()),
        config.timeouts.search,
    )
    .await?
    .ok_or_else(|| GatewayError::UpstreamError("no matching decision found".to_string()))?;

    let evidence_ctx = EvidenceContext {
        anchor_id,
        policy_fp: "none".to_string(),
        snapshot_etag_hint: None,
        neighbor_k: 10,
    };
    let (mut bundle, retries) = evidence::build_evidence(
        deps.memory,
        deps.cache,
        &evidence_ctx,
        &config.timeouts,
        config.cache_ttl,
    )
    .await?;
    let evidence_pre = bundle.clone();

    let policy_input = policy_gate::build_policy_input(req.identity.clone(), &bundle, req.headers.clone());
    let policy_outcome = policy_gate::apply_policy_gate(deps.policy, config, &policy_input, &mut bundle).await?;

    let selection = selector::select("why_decision", &req.question, bundle, &config.budget);
    let evidence_post = selection.envelope.evidence.clone();

    let llm_outcome = if config.openai_disabled {
        llm_invoke::LlmOutcome {
            answer_json: None,
            fallback_reason: Some(FallbackReason::LlmOff),
        }
    } else {
        llm_invoke::invoke_llm(deps.llm, &selection.envelope, config.timeouts.llm).await
    };

    let mut final_bundle = evidence_post.clone();
    let mut fallback_used = false;
    let mut fallback_reason = None;
    let mut repair_codes = Vec::new();
    let llm_raw_value = llm_outcome.answer_json.clone().unwrap_or(serde_json::Value::Null);

    let (answer, completeness_flags) = match llm_outcome.answer_json {
        Some(raw) => match validator::validate_and_repair(&raw, &mut final_bundle, config.cite_all_ids) {
            Ok(validated) => {
                repair_codes = validated.repair_codes;
                fallback_used = !repair_codes.is_empty();
                (validated.answer, validated.completeness_flags)
            }
            Err(_) => {
                fallback_used = true;
                fallback_reason = Some(FallbackReason::ValidatorFailed);
                (deps.templates.render(&final_bundle), final_bundle.completeness_flags())
            }
        },
        None => {
            fallback_used = true;
            fallback_reason = llm_outcome.fallback_reason;
            (deps.templates.render(&final_bundle), final_bundle.completeness_flags())
        }
    };

    let prompt_fp = fingerprint(&selection.envelope);
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let assembly = AssemblyInput {
        request_id: req.request_id.clone(),
        intent: "why_decision".to_string(),
        evidence: final_bundle,
        answer,
        completeness_flags,
        prompt_fp,
        policy_fp: Some(policy_outcome.policy_fp),
        prompt_tokens: selection.prompt_tokens,
        max_prompt_tokens: selection.max_tokens,
        dropped_evidence_ids: selection.dropped_evidence_ids,
        selector_truncation: selection.selector_truncation,
        total_neighbors_found: selection.total_neighbors_found,
        final_evidence_count: selection.final_evidence_count,
        retries,
        fallback_used,
        fallback_reason,
        repair_codes: repair_codes.clone(),
        latency_ms,
        load_shed: req.load_shed || policy_outcome.degraded,
    };
    let response = assembler::assemble_and_sign(assembly, deps.signer, config.gateway_version.clone());

    let rendered_prompt = selector::render_messages(&selection.envelope).join("\n\n---\n\n");
    let validator_report = serde_json::json!({
        "repair_codes": repair_codes,
        "fallback_used": fallback_used,
        "fallback_reason": fallback_reason,
    });
    let artefacts = Artefacts::build(
        &selection.envelope,
        &rendered_prompt,
        &llm_raw_value,
        &validator_report,
        &response,
        &evidence_pre,
        &evidence_post,
    );
    persister::persist_artefacts(deps.object_store, config, &req.request_id, &artefacts).await?;

    Ok(response)
}
