use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{DefaultBodyLimit, Extension, Multipart, Path, Request, State};
use axum::http::header::{
    AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, COOKIE, SET_COOKIE,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use datawash_worker_client::{WorkerClient, WorkerClientError};

pub mod api_envelope;
pub mod audit;
pub mod auth;
pub mod config;
pub mod delegation;
pub mod jobs;
pub mod results;


use crate::api_envelope::{
    ApiErrorCode, ApiErrorTuple, conflict_error, data_with_status, error_response, internal_error,
    not_found_error, ok_data, unauthorized_error, validation_error,
};
use crate::audit::{AuditError, AuditEventKind, AuditTrail, Database};
use crate::auth::{AuthError, AuthService, AuthSession, SESSION_COOKIE_NAME, UserView};
use crate::config::Config;
use crate::delegation::{DelegationReporter, Delegator, spawn_supervisor};
use crate::jobs::{Job, JobEvent, JobMode, JobStore, JobStoreError};
use crate::results::{ResultKind, ResultStore};

const SERVICE_NAME: &str = "datawash-gateway";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    auth: AuthService,
    jobs: JobStore,
    results: ResultStore,
    audit: AuditTrail,
    delegator: Delegator,
    started_at: SystemTime,
}

#[derive(Debug, Error)]
pub enum GatewayInitError {
    #[error("audit store initialization failed: {0}")]
    Audit(#[from] AuditError),
    #[error("worker client initialization failed: {0}")]
    Worker(#[from] WorkerClientError),
}

/// Builds the full router. Opens the audit database and runs migrations, so
/// the service never accepts traffic against an unmigrated store.
pub fn build_router(config: Config) -> Result<Router, GatewayInitError> {
    Ok(router_with_state(init_state(config)?))
}

fn init_state(config: Config) -> Result<AppState, GatewayInitError> {
    let database = match &config.audit_db_path {
        Some(path) => Database::open(path)?,
        None => Database::open_in_memory()?,
    };
    let audit = AuditTrail::new(database);
    let worker = WorkerClient::from_base_url(&config.worker_base_url, config.worker_timeout_ms)?;

    let jobs = JobStore::from_config(&config);
    let results = ResultStore::from_config(&config);
    let auth = AuthService::from_config(&config);

    let (reporter, failures) = DelegationReporter::channel();
    spawn_supervisor(failures);

    let delegator = Delegator {
        jobs: jobs.clone(),
        results: results.clone(),
        audit: audit.clone(),
        worker,
        reporter,
    };

    Ok(AppState {
        config: Arc::new(config),
        auth,
        jobs,
        results,
        audit,
        delegator,
        started_at: SystemTime::now(),
    })
}

fn router_with_state(state: AppState) -> Router {
    let max_upload_bytes = state.config.max_upload_bytes;
    let session_gate_state = state.clone();

    let protected_router = Router::new()
        .route("/me", get(me))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/analyze/:job_id", post(analyze_job))
        .route("/status/:job_id", get(job_status))
        .route("/results/:job_id", get(analysis_result))
        .route("/results/:job_id/export", get(analysis_result_export))
        .route("/clean/:job_id", post(clean_job))
        .route("/cleaned/:job_id", get(cleaned_artifact))
        .route("/cleaning-result/:job_id", get(cleaning_result))
        .route("/cleaning-result/:job_id/export", get(cleaning_result_export))
        .route("/jobs", get(list_jobs).delete(delete_jobs))
        .route_layer(middleware::from_fn_with_state(
            session_gate_state,
            auth_session_gate,
        ));

    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/health", get(health))
        .merge(protected_router)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn auth_session_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match session_from_headers(&state, request.headers()) {
        Ok(session) => {
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        Err(response) => response.into_response(),
    }
}

fn session_from_headers(state: &AppState, headers: &HeaderMap) -> Result<AuthSession, ApiErrorTuple> {
    let token = bearer_token(headers)
        .or_else(|| extract_cookie_value(headers, SESSION_COOKIE_NAME))
        .ok_or_else(|| unauthorized_error("Authentication required."))?;

    state.auth.verify_token(&token).map_err(|error| match error {
        AuthError::TokenExpired => unauthorized_error("Session has expired."),
        _ => unauthorized_error("Session token is invalid."),
    })
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct UserEnvelope {
    user: UserView,
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let user = state
        .auth
        .register(&request.email, &request.password)
        .await
        .map_err(auth_error_response)?;

    Ok(data_with_status(StatusCode::CREATED, UserEnvelope { user }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ApiErrorTuple> {
    let (user, token) = state
        .auth
        .login(&request.email, &request.password)
        .await
        .map_err(auth_error_response)?;

    let cookie = session_cookie(&token, state.config.session_ttl_seconds);
    let mut response = ok_data(UserEnvelope { user }).into_response();
    append_set_cookie_header(&mut response, &cookie)?;
    Ok(response)
}

async fn logout() -> Result<Response, ApiErrorTuple> {
    let mut response = ok_data(json!({ "ok": true })).into_response();
    append_set_cookie_header(&mut response, &clear_cookie(SESSION_COOKIE_NAME))?;
    Ok(response)
}

async fn me(Extension(session): Extension<AuthSession>) -> impl IntoResponse {
    ok_data(json!({
        "user": {
            "id": session.subject_id,
            "email": session.email,
            "role": session.role.as_str(),
        }
    }))
}

async fn upload(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let mut upload: Option<(String, axum::body::Bytes)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(error) => {
                return Err(validation_error("file", &format!("invalid multipart body: {error}")));
            }
        };

        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(sanitize_filename)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|error| validation_error("file", &format!("failed to read upload: {error}")))?;
        upload = Some((filename, bytes));
        break;
    }

    let Some((filename, bytes)) = upload else {
        return Err(validation_error("file", "multipart field 'file' is required"));
    };
    if bytes.is_empty() {
        return Err(validation_error("file", "uploaded file is empty"));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let mode = JobMode::for_size(bytes.len() as u64);

    let source_path = state.config.upload_dir.join(format!("{job_id}_{filename}"));
    tokio::fs::create_dir_all(&state.config.upload_dir)
        .await
        .map_err(|error| internal_error(format!("failed to prepare upload directory: {error}")))?;
    tokio::fs::write(&source_path, &bytes)
        .await
        .map_err(|error| internal_error(format!("failed to store upload: {error}")))?;

    let job = state
        .jobs
        .create(
            job_id,
            session.subject_id.clone(),
            mode,
            filename.clone(),
            source_path.to_string_lossy().to_string(),
        )
        .await
        .map_err(job_error_response)?;

    state
        .audit
        .append(
            Some(&job.id),
            AuditEventKind::JobCreated,
            &json!({ "owner": session.subject_id, "mode": mode.as_str() }),
        )
        .map_err(audit_error_response)?;
    state
        .audit
        .append(
            Some(&job.id),
            AuditEventKind::FileReceived,
            &json!({ "filename": filename, "bytes": bytes.len() }),
        )
        .map_err(audit_error_response)?;

    tracing::info!(
        target: "datawash.jobs",
        job_id = %job.id,
        mode = mode.as_str(),
        bytes = bytes.len(),
        "upload accepted",
    );

    Ok(data_with_status(
        StatusCode::ACCEPTED,
        json!({
            "job_id": job.id,
            "status": job.status.as_str(),
            "mode": job.mode.as_str(),
        }),
    ))
}

async fn analyze_job(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let job = state
        .jobs
        .resolve_accessible(&job_id, &session)
        .await
        .ok_or_else(|| not_found_error("Job not found."))?;

    let job = state
        .jobs
        .transition(&job.id, JobEvent::AnalysisDelegated)
        .await
        .map_err(job_error_response)?;

    state
        .audit
        .append(
            Some(&job.id),
            AuditEventKind::AnalysisEnqueued,
            &json!({ "mode": job.mode.as_str() }),
        )
        .map_err(audit_error_response)?;

    state.delegator.spawn_analysis(job.clone());

    Ok(data_with_status(
        StatusCode::ACCEPTED,
        json!({ "job_id": job.id, "status": job.status.as_str() }),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    // Absent and inaccessible are deliberately the same answer.
    let status = match state.jobs.resolve_accessible(&job_id, &session).await {
        Some(job) => job.status.as_str(),
        None => "unknown",
    };
    ok_data(json!({ "status": status }))
}

async fn analysis_result(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let job = state
        .jobs
        .resolve_accessible(&job_id, &session)
        .await
        .ok_or_else(|| not_found_error("Job not found."))?;
    let record = state
        .results
        .analysis_for(&job.id)
        .await
        .ok_or_else(|| not_found_error("No analysis result for this job."))?;

    let body = record
        .envelope
        .decode(ResultKind::Analysis)
        .map_err(|error| internal_error(error.to_string()))?;

    Ok(ok_data(json!({
        "cleaned_data": body.get("cleaned_data").cloned().unwrap_or(Value::Null),
        "quality_report": body.get("quality_report").cloned().unwrap_or(Value::Null),
    })))
}

async fn analysis_result_export(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let job = state
        .jobs
        .resolve_accessible(&job_id, &session)
        .await
        .ok_or_else(|| not_found_error("Job not found."))?;
    let record = state
        .results
        .analysis_for(&job.id)
        .await
        .ok_or_else(|| not_found_error("No analysis result for this job."))?;

    Ok(ok_data(json!({
        "job": job_metadata(&job),
        "result": record.envelope,
        "summary": record.summary,
        "exported_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CleanJobRequest {
    mode: Option<String>,
    rules: Option<Vec<String>>,
}

async fn clean_job(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(job_id): Path<String>,
    body: Option<Json<CleanJobRequest>>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let Json(request) = body.unwrap_or_default();
    let job = state
        .jobs
        .resolve_accessible(&job_id, &session)
        .await
        .ok_or_else(|| not_found_error("Job not found."))?;

    let job = state
        .jobs
        .transition(&job.id, JobEvent::CleaningDelegated)
        .await
        .map_err(job_error_response)?;

    let rules = request.rules.unwrap_or_default();
    state
        .audit
        .append(
            Some(&job.id),
            AuditEventKind::CleaningEnqueued,
            &json!({ "requested_mode": request.mode, "rules": rules }),
        )
        .map_err(audit_error_response)?;

    state
        .delegator
        .spawn_cleaning(job.clone(), request.mode, rules);

    Ok(data_with_status(
        StatusCode::ACCEPTED,
        json!({ "job_id": job.id, "status": job.status.as_str() }),
    ))
}

async fn cleaned_artifact(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiErrorTuple> {
    let job = state
        .jobs
        .resolve_accessible(&job_id, &session)
        .await
        .ok_or_else(|| not_found_error("Job not found."))?;
    let cleaned_path = job
        .cleaned_path
        .as_ref()
        .ok_or_else(|| not_found_error("No cleaned artifact for this job."))?;

    let bytes = match tokio::fs::read(cleaned_path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(not_found_error("No cleaned artifact for this job."));
        }
        Err(error) => {
            return Err(internal_error(format!("failed to read cleaned artifact: {error}")));
        }
    };

    let disposition = format!(
        "attachment; filename=\"cleaned_{}\"",
        sanitize_filename(&job.source_filename)
    );
    let mut response = bytes.into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    response
        .headers_mut()
        .insert(CONTENT_DISPOSITION, header_value(&disposition)?);
    Ok(response)
}

async fn cleaning_result(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let job = state
        .jobs
        .resolve_accessible(&job_id, &session)
        .await
        .ok_or_else(|| not_found_error("Job not found."))?;
    let record = state
        .results
        .cleaning_for(&job.id)
        .await
        .ok_or_else(|| not_found_error("No cleaning result for this job."))?;

    let body = record
        .envelope
        .decode(ResultKind::Cleaning)
        .map_err(|error| internal_error(error.to_string()))?;

    Ok(ok_data(json!({
        "cleaned_file_path": body.get("cleaned_file_path").cloned().unwrap_or(Value::Null),
        "rules_applied": record.summary.rules_applied,
        "rows_removed": record.summary.rows_removed,
    })))
}

async fn cleaning_result_export(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let job = state
        .jobs
        .resolve_accessible(&job_id, &session)
        .await
        .ok_or_else(|| not_found_error("Job not found."))?;
    let record = state
        .results
        .cleaning_for(&job.id)
        .await
        .ok_or_else(|| not_found_error("No cleaning result for this job."))?;

    Ok(ok_data(json!({
        "job": job_metadata(&job),
        "result": record.envelope,
        "summary": record.summary,
        "exported_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })))
}

async fn list_jobs(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
) -> impl IntoResponse {
    let jobs = state.jobs.list_visible(&session).await;
    let mut listings = Vec::with_capacity(jobs.len());
    for job in jobs {
        let has_analysis_result = state.results.has_analysis(&job.id).await;
        let has_cleaning_result = state.results.has_cleaning(&job.id).await;
        let mut entry = job_metadata(&job);
        entry["has_analysis_result"] = json!(has_analysis_result);
        entry["has_cleaning_result"] = json!(has_cleaning_result);
        listings.push(entry);
    }

    ok_data(json!({ "jobs": listings }))
}

#[derive(Debug, Deserialize)]
struct DeleteJobsRequest {
    job_ids: Vec<String>,
}

async fn delete_jobs(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    Json(request): Json<DeleteJobsRequest>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let mut deleted = Vec::new();

    for job_id in &request.job_ids {
        // Inaccessible ids are skipped, not errors: deletion is idempotent
        // and must not leak foreign job existence.
        let Some(job) = state.jobs.resolve_accessible(job_id, &session).await else {
            continue;
        };

        state
            .results
            .delete_for_job(&job.id)
            .await
            .map_err(|error| internal_error(error.to_string()))?;
        if state
            .jobs
            .delete(&job.id)
            .await
            .map_err(job_error_response)?
            .is_none()
        {
            continue;
        }

        remove_artifact(&job.source_path).await;
        if let Some(cleaned_path) = &job.cleaned_path {
            remove_artifact(cleaned_path).await;
        }

        state
            .audit
            .append(
                Some(&job.id),
                AuditEventKind::JobDeleted,
                &json!({ "deleted_by": session.subject_id }),
            )
            .map_err(audit_error_response)?;

        deleted.push(job.id);
    }

    Ok(ok_data(json!({ "deleted": deleted })))
}

/// Artifact removal is best effort; a file already gone is not an error.
async fn remove_artifact(path: &str) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                target: "datawash.jobs",
                path,
                error = %error,
                "failed to remove job artifact",
            );
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

async fn health(State(state): State<AppState>) -> Response {
    let uptime_seconds = state
        .started_at
        .elapsed()
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    match state.audit.ping() {
        Ok(()) => Json(HealthResponse {
            status: "ok",
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds,
        })
        .into_response(),
        Err(error) => {
            tracing::error!(target: "datawash.audit", error = %error, "health probe failed");
            error_response(ApiErrorCode::ServiceUnavailable, "Audit store is unavailable.")
                .into_response()
        }
    }
}

fn job_metadata(job: &Job) -> Value {
    json!({
        "id": job.id,
        "status": job.status.as_str(),
        "mode": job.mode.as_str(),
        "source_filename": job.source_filename,
        "cleaned_path": job.cleaned_path,
        "created_at": job.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "updated_at": job.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

fn auth_error_response(error: AuthError) -> ApiErrorTuple {
    match error {
        AuthError::InvalidEmail => validation_error("email", "Email address is not valid."),
        AuthError::PasswordTooShort => {
            validation_error("password", "Password must be at least 8 characters.")
        }
        AuthError::EmailTaken => conflict_error("An account with this email already exists."),
        AuthError::InvalidCredentials => unauthorized_error("Invalid email or password."),
        AuthError::TokenInvalid | AuthError::TokenExpired => {
            unauthorized_error("Session token is invalid.")
        }
        AuthError::Hashing { .. } | AuthError::Persistence { .. } => {
            internal_error("Account operation failed.")
        }
    }
}

fn job_error_response(error: JobStoreError) -> ApiErrorTuple {
    match error {
        JobStoreError::NotFound => not_found_error("Job not found."),
        JobStoreError::InvalidTransition { from, event } => {
            conflict_error(format!("Job cannot accept '{event}' while '{from}'."))
        }
        JobStoreError::Persistence { message } => internal_error(message),
    }
}

fn audit_error_response(error: AuditError) -> ApiErrorTuple {
    internal_error(format!("audit append failed: {error}"))
}

fn session_cookie(token: &str, max_age_seconds: u64) -> String {
    format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_seconds}"
    )
}

fn clear_cookie(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

fn append_set_cookie_header(response: &mut Response, cookie: &str) -> Result<(), ApiErrorTuple> {
    response.headers_mut().append(SET_COOKIE, header_value(cookie)?);
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiErrorTuple> {
    HeaderValue::from_str(value)
        .map_err(|_| internal_error("Failed to encode response header."))
}

fn extract_cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    for part in raw.split(';') {
        // Segments without '=' (stray flags) are skipped, not fatal.
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };

        if key.trim() == cookie_name {
            return non_empty(value.trim().to_string());
        }
    }

    None
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = authorization.strip_prefix("Bearer ")?.trim();
    non_empty(token.to_string())
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn sanitize_filename(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
