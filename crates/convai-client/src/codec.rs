//! JSON codec for the conversation protocol.
//!
//! Inbound messages are decoded by hand rather than through derived
//! `Deserialize` impls: the server nests most payloads under a type-specific
//! key, falls back to flat objects for some types, and omits or nulls fields
//! freely. Missing fields decode to defaults instead of failing the message.

use crate::error::DecodeError;
use convai_types::{
    AgentChatResponsePart, AgentResponse, AgentResponseCorrection, AgentResponseMetadata,
    AgentToolResponse, AudioAlignment, AudioChunk, ChatPartPhase, ClientToolCall,
    ConversationInitiationMetadata, InboundEvent, Interruption, OutboundEvent, Payload, Ping,
    ServerError, TentativeAgentResponse, TentativeUserTranscript, UserTranscript, VadScore,
};
use serde_json::Value;

const TYPE_KEY: &str = "type";

/// Parses one raw protocol message.
pub fn decode(raw: &str) -> Result<InboundEvent, DecodeError> {
    let Value::Object(root) = serde_json::from_str::<Value>(raw)? else {
        return Err(DecodeError::NotAnObject);
    };
    let event_type = root.get(TYPE_KEY).and_then(Value::as_str);

    let event = match event_type {
        Some("conversation_initiation_metadata") => decode_initiation_metadata(&root),
        Some("audio") => decode_audio(&root),
        Some("agent_response") => decode_agent_response(&root),
        Some("agent_response_correction") => decode_agent_response_correction(&root),
        Some("user_transcript") => decode_user_transcript(&root),
        Some("tentative_user_transcript") => decode_tentative_user_transcript(&root),
        Some("agent_chat_response_part") => decode_chat_response_part(&root)?,
        Some("internal_tentative_agent_response") => decode_tentative_agent_response(&root),
        Some("agent_response_metadata") => decode_agent_response_metadata(&root),
        Some("client_tool_call") | Some("agent_tool_request") => decode_client_tool_call(&root),
        Some("agent_tool_response") => decode_agent_tool_response(&root),
        Some("vad_score") => decode_vad_score(&root),
        Some("interruption") => decode_interruption(&root),
        Some("audio_alignment") => decode_audio_alignment(&root),
        Some("ping") => decode_ping(&root),
        Some("error") => decode_error(&root),
        other => return Err(DecodeError::UnknownEventType(other.map(str::to_owned))),
    };
    Ok(event)
}

/// Serializes an outbound event to its JSON wire form.
pub fn encode(event: &OutboundEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

// --- Per-type decoders ---

fn decode_ping(root: &Payload) -> InboundEvent {
    let obj = nested(root, "ping_event");
    InboundEvent::Ping(Ping {
        event_id: int(obj, "event_id"),
        ping_ms: opt_int(obj, "ping_ms"),
    })
}

fn decode_agent_response(root: &Payload) -> InboundEvent {
    let obj = nested(root, "agent_response_event");
    InboundEvent::AgentResponse(AgentResponse {
        text: string(obj, "agent_response"),
        event_id: opt_int(obj, "event_id"),
    })
}

fn decode_user_transcript(root: &Payload) -> InboundEvent {
    let obj = nested(root, "user_transcription_event");
    InboundEvent::UserTranscript(UserTranscript {
        text: string(obj, "user_transcript"),
    })
}

fn decode_tentative_user_transcript(root: &Payload) -> InboundEvent {
    let obj = nested(root, "tentative_user_transcription_event");
    InboundEvent::TentativeUserTranscript(TentativeUserTranscript {
        text: string(obj, "user_transcript"),
        event_id: opt_int(obj, "event_id"),
    })
}

fn decode_tentative_agent_response(root: &Payload) -> InboundEvent {
    let obj = nested(root, "tentative_agent_response_internal_event");
    InboundEvent::TentativeAgentResponse(TentativeAgentResponse {
        text: string(obj, "tentative_agent_response"),
    })
}

fn decode_chat_response_part(root: &Payload) -> Result<InboundEvent, DecodeError> {
    let obj = nested(root, "text_response_part");
    let raw_phase = string(obj, "type");
    let phase = ChatPartPhase::from_wire(&raw_phase).ok_or_else(|| DecodeError::InvalidField {
        field: "text_response_part.type",
        value: format!("{raw_phase:?}"),
    })?;
    Ok(InboundEvent::AgentChatResponsePart(AgentChatResponsePart {
        phase,
        text: string(obj, "text"),
    }))
}

fn decode_client_tool_call(root: &Payload) -> InboundEvent {
    let obj = nested(root, "client_tool_call")
        .or_else(|| nested(root, "agent_tool_request"))
        .or(Some(root));

    // Absent or null means the agent waits for a reply. Fire-and-forget tools
    // are explicitly marked `false` by the server.
    let expects_response = obj
        .and_then(|o| o.get("expects_response"))
        .and_then(as_bool)
        .unwrap_or(true);

    InboundEvent::ClientToolCall(ClientToolCall {
        tool_name: string(obj, "tool_name"),
        parameters: object(obj, "parameters"),
        tool_call_id: string(obj, "tool_call_id"),
        expects_response,
    })
}

fn decode_agent_tool_response(root: &Payload) -> InboundEvent {
    let obj = nested_or_flat(root, "agent_tool_response");
    InboundEvent::AgentToolResponse(AgentToolResponse {
        tool_name: string(obj, "tool_name"),
        tool_call_id: string(obj, "tool_call_id"),
        tool_type: string(obj, "tool_type"),
        is_error: boolean(obj, "is_error"),
    })
}

fn decode_vad_score(root: &Payload) -> InboundEvent {
    let obj = nested_or_flat(root, "vad_score_event");
    let score = obj
        .and_then(|o| o.get("vad_score"))
        .and_then(as_float)
        .unwrap_or(0.0);
    InboundEvent::VadScore(VadScore {
        score: score as f32,
    })
}

fn decode_interruption(root: &Payload) -> InboundEvent {
    let obj = nested(root, "interruption_event");
    InboundEvent::Interruption(Interruption {
        event_id: int(obj, "event_id"),
    })
}

fn decode_audio_alignment(root: &Payload) -> InboundEvent {
    let alignment = nested(root, "audio_alignment_event")
        .cloned()
        .unwrap_or_else(|| without_type(root));
    InboundEvent::AudioAlignment(AudioAlignment { alignment })
}

fn decode_agent_response_metadata(root: &Payload) -> InboundEvent {
    let metadata = nested(root, "agent_response_metadata_event")
        .cloned()
        .unwrap_or_else(|| without_type(root));
    InboundEvent::AgentResponseMetadata(AgentResponseMetadata { metadata })
}

fn decode_initiation_metadata(root: &Payload) -> InboundEvent {
    let obj = nested_or_flat(root, "conversation_initiation_metadata");
    InboundEvent::ConversationInitiationMetadata(ConversationInitiationMetadata {
        conversation_id: string(obj, "conversation_id"),
        agent_output_audio_format: string(obj, "agent_output_audio_format"),
        user_input_audio_format: string(obj, "user_input_audio_format"),
    })
}

fn decode_audio(root: &Payload) -> InboundEvent {
    let nested_audio = nested(root, "audio_event");
    let obj = nested_audio.unwrap_or(root);
    let has_alignment = obj.get("alignment").is_some_and(|v| !v.is_null());
    let has_audio = obj.contains_key("audio_base64") || obj.contains_key("audio_base_64");

    // Some server versions forward alignment-only payloads on the `audio` type.
    if has_alignment && !has_audio {
        let alignment = match nested_audio {
            Some(audio) => audio.clone(),
            None => without_type(root),
        };
        return InboundEvent::AudioAlignment(AudioAlignment { alignment });
    }

    let audio_base64 = if obj.contains_key("audio_base64") {
        string(Some(obj), "audio_base64")
    } else {
        string(Some(obj), "audio_base_64")
    };
    InboundEvent::Audio(AudioChunk {
        event_id: int(Some(obj), "event_id"),
        audio_base64,
    })
}

fn decode_error(root: &Payload) -> InboundEvent {
    let nested_error = nested(root, "error_event");
    let code = nested_error
        .and_then(|o| o.get("code"))
        .and_then(as_int)
        .or_else(|| root.get("code").and_then(as_int))
        .unwrap_or(ServerError::DEFAULT_CODE);
    let message = opt_string(nested_error, "message").or_else(|| opt_string(Some(root), "message"));
    InboundEvent::ServerError(ServerError { code, message })
}

fn decode_agent_response_correction(root: &Payload) -> InboundEvent {
    let obj = nested_or_flat(root, "agent_response_correction_event");
    InboundEvent::AgentResponseCorrection(AgentResponseCorrection {
        original: string(obj, "original_agent_response"),
        corrected: string(obj, "corrected_agent_response"),
    })
}

// --- Field helpers ---
//
// All helpers take `Option<&Payload>` so an absent nested object reads the
// same as an object with every field missing.

fn nested<'a>(root: &'a Payload, key: &str) -> Option<&'a Payload> {
    root.get(key).and_then(Value::as_object)
}

fn nested_or_flat<'a>(root: &'a Payload, key: &str) -> Option<&'a Payload> {
    nested(root, key).or(Some(root))
}

fn without_type(root: &Payload) -> Payload {
    let mut copy = root.clone();
    copy.remove(TYPE_KEY);
    copy
}

fn field<'a>(obj: Option<&'a Payload>, key: &str) -> Option<&'a Value> {
    obj.and_then(|o| o.get(key)).filter(|v| !v.is_null())
}

fn string(obj: Option<&Payload>, key: &str) -> String {
    opt_string(obj, key).unwrap_or_default()
}

fn opt_string(obj: Option<&Payload>, key: &str) -> Option<String> {
    field(obj, key).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn int(obj: Option<&Payload>, key: &str) -> i64 {
    opt_int(obj, key).unwrap_or(0)
}

fn opt_int(obj: Option<&Payload>, key: &str) -> Option<i64> {
    field(obj, key).and_then(as_int)
}

fn boolean(obj: Option<&Payload>, key: &str) -> bool {
    field(obj, key).and_then(as_bool).unwrap_or(false)
}

fn object(obj: Option<&Payload>, key: &str) -> Payload {
    field(obj, key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
