//! REST handlers for the speaker routes.

use std::collections::HashMap;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::audio::{decode_wav, write_wav};
use crate::error::Error;
use crate::manager::{IdentifyResult, SpeakerStats, VerifyResult};

use super::{tenant_id, threshold_override, ApiResult, AppState, AuthContext};

const UID_REQUIRED: &str = "uid is required (X-User-ID header, uid query param, or uid form field)";

/// Parsed multipart upload: text fields plus the audio file.
#[derive(Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    audio: Option<Vec<u8>>,
}

async fn read_multipart(mut multipart: Multipart) -> ApiResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidInput(format!("invalid multipart body: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == "audio" {
            if let Some(filename) = field.file_name() {
                if !filename.to_lowercase().ends_with(".wav") {
                    return Err(Error::InvalidInput("only WAV files are supported".into()).into());
                }
            }
            let data = field
                .bytes()
                .await
                .map_err(|e| Error::InvalidInput(format!("failed to read audio field: {e}")))?;
            form.audio = Some(data.to_vec());
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| Error::InvalidInput(format!("failed to read field {name}: {e}")))?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

/// Resolves both tenant identifiers with the uniform precedence chain.
fn tenant_ids(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    form: &HashMap<String, String>,
    auth: Option<&AuthContext>,
) -> (String, String) {
    let uid = tenant_id(
        headers,
        "x-user-id",
        query,
        "uid",
        form,
        auth.map(|a| a.user_id.as_str()),
    );
    let agent_id = tenant_id(
        headers,
        "x-agent-id",
        query,
        "agent_id",
        form,
        auth.map(|a| a.agent_id.as_str()),
    );
    (uid, agent_id)
}

/// Optional identification parameter from query or form, query first.
fn param(query: &HashMap<String, String>, form: &HashMap<String, String>, key: &str) -> String {
    query
        .get(key)
        .or_else(|| form.get(key))
        .cloned()
        .unwrap_or_default()
}

fn required_field<'a>(form: &'a UploadForm, key: &str) -> ApiResult<&'a str> {
    match form.fields.get(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::missing(key).into()),
    }
}

fn required_audio(form: &UploadForm) -> ApiResult<&[u8]> {
    form.audio
        .as_deref()
        .ok_or_else(|| Error::InvalidInput("audio file is required".into()).into())
}

/// Debug sidecar: saves the decoded utterance under `data_dir`.
/// Never fails the request.
fn maybe_dump(state: &AppState, op: &str, samples: &[f32], sample_rate: u32) {
    let config = &state.config;
    if !config.dump_audio || config.data_dir.is_empty() {
        return;
    }
    let dir = std::path::Path::new(&config.data_dir);
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(error = %e, "failed to create data dir for audio dump");
        return;
    }
    let path = dir.join(format!("{op}_{}.wav", Utc::now().timestamp_millis()));
    if let Err(e) = write_wav(&path, samples, sample_rate) {
        warn!(error = %e, path = %path.display(), "failed to dump audio");
    }
}

/// POST /api/v1/speaker/register
pub(crate) async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    auth: Option<Extension<AuthContext>>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let form = read_multipart(multipart).await?;
    let (uid, agent_id) = tenant_ids(&headers, &query, &form.fields, auth.as_deref());
    if uid.is_empty() {
        return Err(Error::InvalidInput(UID_REQUIRED.into()).into());
    }
    let speaker_id = required_field(&form, "speaker_id")?.to_string();
    let speaker_name = required_field(&form, "speaker_name")?.to_string();
    let uuid = required_field(&form, "uuid")?.to_string();

    let audio = required_audio(&form)?;
    let (samples, sample_rate) = decode_wav(audio, state.config.audio.normalize_factor)?;
    maybe_dump(&state, "register", &samples, sample_rate);

    // Enrolment keeps natural onset/offset: trim silence but leave 100ms
    // edges around the speech region.
    let samples = match state.manager.silence_filter() {
        Some(filter) => filter.trim_speech_keep_edges(&samples, sample_rate).await?,
        None => samples,
    };

    state
        .manager
        .register_speaker(
            &uid,
            &agent_id,
            &speaker_id,
            &speaker_name,
            &uuid,
            &samples,
            sample_rate,
        )
        .await?;

    Ok(Json(json!({
        "message": "Speaker registered successfully",
        "uid": uid,
        "agent_id": agent_id,
        "speaker_id": speaker_id,
        "speaker_name": speaker_name,
        "uuid": uuid,
    })))
}

/// POST /api/v1/speaker/identify
pub(crate) async fn identify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    auth: Option<Extension<AuthContext>>,
    multipart: Multipart,
) -> ApiResult<Json<IdentifyResult>> {
    let form = read_multipart(multipart).await?;
    let (uid, agent_id) = tenant_ids(&headers, &query, &form.fields, auth.as_deref());
    let speaker_id = param(&query, &form.fields, "speaker_id");
    let speaker_name = param(&query, &form.fields, "speaker_name");
    let threshold = threshold_override(&query, &form.fields);

    let audio = required_audio(&form)?;
    let (samples, sample_rate) = decode_wav(audio, state.config.audio.normalize_factor)?;
    maybe_dump(&state, "identify", &samples, sample_rate);

    let result = state
        .manager
        .identify_speaker(
            &uid,
            &agent_id,
            &speaker_id,
            &speaker_name,
            &samples,
            sample_rate,
            threshold,
        )
        .await?;
    Ok(Json(result))
}

/// POST /api/v1/speaker/verify/:speaker_id
pub(crate) async fn verify(
    State(state): State<AppState>,
    Path(speaker_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    auth: Option<Extension<AuthContext>>,
    multipart: Multipart,
) -> ApiResult<Json<VerifyResult>> {
    let form = read_multipart(multipart).await?;
    let (uid, agent_id) = tenant_ids(&headers, &query, &form.fields, auth.as_deref());
    if uid.is_empty() {
        return Err(Error::InvalidInput(UID_REQUIRED.into()).into());
    }
    if speaker_id.is_empty() {
        return Err(Error::missing("speaker_id").into());
    }

    let audio = required_audio(&form)?;
    let (samples, sample_rate) = decode_wav(audio, state.config.audio.normalize_factor)?;
    maybe_dump(&state, "verify", &samples, sample_rate);

    let result = state
        .manager
        .verify_speaker(&uid, &agent_id, &speaker_id, &samples, sample_rate)
        .await?;
    Ok(Json(result))
}

/// GET /api/v1/speaker/list
pub(crate) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    auth: Option<Extension<AuthContext>>,
) -> ApiResult<Json<Value>> {
    let empty = HashMap::new();
    let (uid, agent_id) = tenant_ids(&headers, &query, &empty, auth.as_deref());
    if uid.is_empty() {
        return Err(Error::InvalidInput(UID_REQUIRED.into()).into());
    }

    let speakers = state.manager.all_speakers(&uid, &agent_id).await?;
    Ok(Json(json!({
        "uid": uid,
        "agent_id": agent_id,
        "total": speakers.len(),
        "speakers": speakers,
    })))
}

/// DELETE /api/v1/speaker/:speaker_id (or ?uuid=... to delete by UUID)
pub(crate) async fn delete_speaker(
    State(state): State<AppState>,
    Path(speaker_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    auth: Option<Extension<AuthContext>>,
) -> ApiResult<Json<Value>> {
    let empty = HashMap::new();
    let (uid, agent_id) = tenant_ids(&headers, &query, &empty, auth.as_deref());
    if uid.is_empty() {
        return Err(Error::InvalidInput(UID_REQUIRED.into()).into());
    }

    if let Some(uuid) = query.get("uuid").filter(|u| !u.is_empty()) {
        state
            .manager
            .delete_speaker_by_uuid(&uid, &agent_id, uuid)
            .await?;
        return Ok(Json(json!({
            "message": "Speaker deleted successfully",
            "uid": uid,
            "uuid": uuid,
        })));
    }

    if speaker_id.is_empty() {
        return Err(Error::missing("speaker_id").into());
    }
    state
        .manager
        .delete_speaker(&uid, &agent_id, &speaker_id)
        .await?;
    Ok(Json(json!({
        "message": "Speaker deleted successfully",
        "uid": uid,
        "speaker_id": speaker_id,
    })))
}

/// GET /api/v1/speaker/stats
pub(crate) async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    auth: Option<Extension<AuthContext>>,
) -> ApiResult<Json<SpeakerStats>> {
    let empty = HashMap::new();
    let (uid, agent_id) = tenant_ids(&headers, &query, &empty, auth.as_deref());
    if uid.is_empty() {
        return Err(Error::InvalidInput(UID_REQUIRED.into()).into());
    }

    let stats = state.manager.stats(&uid, &agent_id).await?;
    Ok(Json(stats))
}

/// POST /api/v1/speaker/register_base64 (reserved)
pub(crate) async fn register_base64() -> ApiResult<Json<Value>> {
    Err(Error::Unimplemented("Base64 API").into())
}

/// POST /api/v1/speaker/identify_base64 (reserved)
pub(crate) async fn identify_base64() -> ApiResult<Json<Value>> {
    Err(Error::Unimplemented("Base64 API").into())
}
