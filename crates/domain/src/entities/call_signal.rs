//! 通话信令记录定义
//!
//! 信令负载建模为封闭的带标签变体（offer/answer/candidate/end），
//! 在系统边界完成校验；变体内部的媒体数据保持不透明。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, SignalId, Timestamp, UserId};

/// 通话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        match raw {
            "voice" => Ok(CallType::Voice),
            "video" => Ok(CallType::Video),
            other => Err(DomainError::validation_error(
                "call_type",
                format!("未知通话类型: {}", other),
            )),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Voice => write!(f, "voice"),
            CallType::Video => write!(f, "video"),
        }
    }
}

/// 信令记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Pending,
    Accepted,
    Rejected,
    Ended,
}

impl SignalStatus {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        match raw {
            "pending" => Ok(SignalStatus::Pending),
            "accepted" => Ok(SignalStatus::Accepted),
            "rejected" => Ok(SignalStatus::Rejected),
            "ended" => Ok(SignalStatus::Ended),
            other => Err(DomainError::validation_error(
                "status",
                format!("未知信令状态: {}", other),
            )),
        }
    }

    /// 终态判定：pending 之外的状态都是终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SignalStatus::Pending)
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalStatus::Pending => write!(f, "pending"),
            SignalStatus::Accepted => write!(f, "accepted"),
            SignalStatus::Rejected => write!(f, "rejected"),
            SignalStatus::Ended => write!(f, "ended"),
        }
    }
}

/// 通话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// 被叫方主动拒绝
    Rejected,
    /// 被叫方正忙（已有进行中的会话）
    Busy,
    /// 响铃超时未应答
    Missed,
    /// 任一方挂断
    Hangup,
}

impl EndReason {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        match raw {
            "rejected" => Ok(EndReason::Rejected),
            "busy" => Ok(EndReason::Busy),
            "missed" => Ok(EndReason::Missed),
            "hangup" => Ok(EndReason::Hangup),
            other => Err(DomainError::validation_error(
                "reason",
                format!("未知结束原因: {}", other),
            )),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Rejected => write!(f, "rejected"),
            EndReason::Busy => write!(f, "busy"),
            EndReason::Missed => write!(f, "missed"),
            EndReason::Hangup => write!(f, "hangup"),
        }
    }
}

/// 信令负载：封闭的带标签变体，每个变体有固定的负载形状
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    /// 呼叫方发出的媒体协商请求，`sdp` 对本系统不透明
    Offer { sdp: JsonValue },
    /// 被叫方接听后的应答
    Answer { sdp: JsonValue },
    /// ICE 候选信息，原样转发
    Candidate { candidate: JsonValue },
    /// 通话终结，携带结束原因
    End { reason: EndReason },
}

impl SignalPayload {
    /// 负载对应的 signal_type 列值
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
            SignalPayload::End { .. } => "end",
        }
    }

    /// 在系统边界解析存储行：未知的 signal_type 直接拒绝。
    /// `end` 负载缺少 reason 时按 `hangup` 处理，兼容只写类型列的旧记录。
    pub fn from_parts(signal_type: &str, data: JsonValue) -> DomainResult<Self> {
        match signal_type {
            "offer" => Ok(SignalPayload::Offer {
                sdp: data.get("sdp").cloned().unwrap_or(JsonValue::Null),
            }),
            "answer" => Ok(SignalPayload::Answer {
                sdp: data.get("sdp").cloned().unwrap_or(JsonValue::Null),
            }),
            "candidate" => Ok(SignalPayload::Candidate {
                candidate: data.get("candidate").cloned().unwrap_or(JsonValue::Null),
            }),
            "end" => {
                let reason = match data.get("reason").and_then(|v| v.as_str()) {
                    Some(raw) => EndReason::parse(raw)?,
                    None => EndReason::Hangup,
                };
                Ok(SignalPayload::End { reason })
            }
            other => Err(DomainError::validation_error(
                "signal_type",
                format!("未知信令类型: {}", other),
            )),
        }
    }

    /// 负载体（不含标签），用于写入 signal_data 列
    pub fn data(&self) -> JsonValue {
        match self {
            SignalPayload::Offer { sdp } => json!({ "sdp": sdp }),
            SignalPayload::Answer { sdp } => json!({ "sdp": sdp }),
            SignalPayload::Candidate { candidate } => json!({ "candidate": candidate }),
            SignalPayload::End { reason } => json!({ "reason": reason.to_string() }),
        }
    }
}

/// 持久化的通话信令记录
///
/// 不变式：对给定的 (caller_id, callee_id) 有序对，最多存在一条
/// `signal_type=offer` 且 `status=pending` 的记录；新的 offer 只有在
/// 前一条到达终态之后才能取而代之。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    /// 信令ID
    pub id: SignalId,
    /// 所属会话ID
    pub conversation_id: ConversationId,
    /// 呼叫方
    pub caller_id: UserId,
    /// 被叫方
    pub callee_id: UserId,
    /// 通话类型
    pub call_type: CallType,
    /// 信令负载
    pub payload: SignalPayload,
    /// 记录状态
    pub status: SignalStatus,
    /// 创建时间
    pub created_at: Timestamp,
}

impl CallSignal {
    /// 构造 offer 记录，初始状态 pending
    pub fn offer(
        conversation_id: ConversationId,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
        sdp: JsonValue,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: SignalId::from(Uuid::new_v4()),
            conversation_id,
            caller_id,
            callee_id,
            call_type,
            payload: SignalPayload::Offer { sdp },
            status: SignalStatus::Pending,
            created_at,
        }
    }

    /// 构造 answer 记录，状态 accepted
    pub fn answer(
        conversation_id: ConversationId,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
        sdp: JsonValue,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: SignalId::from(Uuid::new_v4()),
            conversation_id,
            caller_id,
            callee_id,
            call_type,
            payload: SignalPayload::Answer { sdp },
            status: SignalStatus::Accepted,
            created_at,
        }
    }

    /// 构造 candidate 记录；候选信息只做转发，状态列无业务含义
    pub fn candidate(
        conversation_id: ConversationId,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
        candidate: JsonValue,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: SignalId::from(Uuid::new_v4()),
            conversation_id,
            caller_id,
            callee_id,
            call_type,
            payload: SignalPayload::Candidate { candidate },
            status: SignalStatus::Pending,
            created_at,
        }
    }

    /// 构造 end 记录；状态由结束原因决定（rejected/busy 记为 rejected，
    /// 其余记为 ended）
    pub fn end(
        conversation_id: ConversationId,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
        reason: EndReason,
        created_at: Timestamp,
    ) -> Self {
        let status = match reason {
            EndReason::Rejected | EndReason::Busy => SignalStatus::Rejected,
            EndReason::Missed | EndReason::Hangup => SignalStatus::Ended,
        };
        Self {
            id: SignalId::from(Uuid::new_v4()),
            conversation_id,
            caller_id,
            callee_id,
            call_type,
            payload: SignalPayload::End { reason },
            status,
            created_at,
        }
    }

    /// 信令类型列值
    pub fn signal_type(&self) -> &'static str {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn ids() -> (ConversationId, UserId, UserId) {
        (
            ConversationId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
        )
    }

    #[test]
    fn payload_round_trips_through_parts() {
        let offer = SignalPayload::Offer {
            sdp: json!({"type": "offer", "sdp": "v=0"}),
        };
        let parsed = SignalPayload::from_parts("offer", offer.data()).unwrap();
        assert_eq!(parsed, offer);

        let end = SignalPayload::End {
            reason: EndReason::Busy,
        };
        let parsed = SignalPayload::from_parts("end", end.data()).unwrap();
        assert_eq!(parsed, end);
    }

    #[test]
    fn unknown_signal_type_is_rejected_at_boundary() {
        let result = SignalPayload::from_parts("renegotiate", json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn end_without_reason_defaults_to_hangup() {
        let parsed = SignalPayload::from_parts("end", json!({})).unwrap();
        assert_eq!(
            parsed,
            SignalPayload::End {
                reason: EndReason::Hangup
            }
        );
    }

    #[test]
    fn offer_starts_pending() {
        let (conversation, caller, callee) = ids();
        let signal = CallSignal::offer(
            conversation,
            caller,
            callee,
            CallType::Voice,
            json!({"sdp": "v=0"}),
            Utc::now(),
        );

        assert_eq!(signal.status, SignalStatus::Pending);
        assert_eq!(signal.signal_type(), "offer");
        assert!(!signal.status.is_terminal());
    }

    #[test]
    fn end_status_follows_reason() {
        let (conversation, caller, callee) = ids();
        let rejected = CallSignal::end(
            conversation,
            caller,
            callee,
            CallType::Video,
            EndReason::Rejected,
            Utc::now(),
        );
        assert_eq!(rejected.status, SignalStatus::Rejected);

        let hangup = CallSignal::end(
            conversation,
            caller,
            callee,
            CallType::Video,
            EndReason::Hangup,
            Utc::now(),
        );
        assert_eq!(hangup.status, SignalStatus::Ended);
        assert!(hangup.status.is_terminal());
    }

    #[test]
    fn status_parse_accepts_known_values_only() {
        assert_eq!(SignalStatus::parse("pending").unwrap(), SignalStatus::Pending);
        assert!(SignalStatus::parse("cancelled").is_err());
        assert!(CallType::parse("screen_share").is_err());
    }
}
