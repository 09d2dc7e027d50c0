// 轮询器：判定逻辑与计时解耦，决策机只消费观测值，不碰时钟。
use crate::config::PollingConfig;
use crate::storage::{ConversationStore, MessageRecord, Role};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 轮询终态，Runner 把它原样上报给调用方。
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// 出现了完整的 user→assistant 配对。
    ReplyReceived { reply: String },
    /// 尝试次数用尽仍无回复。超时不回写会话，只通知调用方。
    TimedOut { attempts: u32 },
    /// 连续拉取失败超限。
    Failed { consecutive_failures: u32 },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollDecision {
    Continue,
    Stop(PollOutcome),
}

/// 纯决策机：每次观测推进一步，输出继续或终止。
/// 观测由外部注入，同一观测序列必然得到同一决策序列。
///
/// 停止条件：消息列表末尾是 assistant，且其前一条是内容等于
/// 刚发送文本的 user 消息，即出现了新的完整 user→assistant 配对。
#[derive(Debug, Clone)]
pub struct PollWatch {
    sent_text: String,
    max_attempts: u32,
    max_fetch_failures: u32,
    attempts: u32,
    consecutive_failures: u32,
}

impl PollWatch {
    pub fn new(sent_text: impl Into<String>, config: &PollingConfig) -> Self {
        Self {
            sent_text: sent_text.into(),
            max_attempts: config.max_attempts.max(1),
            max_fetch_failures: config.max_fetch_failures.max(1),
            attempts: 0,
            consecutive_failures: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 一次成功拉取后的观测：传入会话当前的完整消息序列。
    pub fn observe_messages(&mut self, messages: &[MessageRecord]) -> PollDecision {
        self.attempts += 1;
        self.consecutive_failures = 0;
        if let Some(reply) = match_reply_pair(&self.sent_text, messages) {
            return PollDecision::Stop(PollOutcome::ReplyReceived { reply });
        }
        if self.attempts >= self.max_attempts {
            return PollDecision::Stop(PollOutcome::TimedOut {
                attempts: self.attempts,
            });
        }
        PollDecision::Continue
    }

    /// 一次拉取失败后的观测。失败不计入尝试上限，只看连续失败数。
    pub fn observe_failure(&mut self) -> PollDecision {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.max_fetch_failures {
            return PollDecision::Stop(PollOutcome::Failed {
                consecutive_failures: self.consecutive_failures,
            });
        }
        PollDecision::Continue
    }
}

fn match_reply_pair(sent_text: &str, messages: &[MessageRecord]) -> Option<String> {
    let [.., user, assistant] = messages else {
        return None;
    };
    if assistant.role == Role::Assistant
        && user.role == Role::User
        && user.content == sent_text
    {
        return Some(assistant.content.clone());
    }
    None
}

/// 异步轮询 Runner：按固定间隔拉取会话，把决策交给 PollWatch。
pub struct PollRunner {
    store: Arc<dyn ConversationStore>,
    config: PollingConfig,
}

impl PollRunner {
    pub fn new(store: Arc<dyn ConversationStore>, config: PollingConfig) -> Self {
        Self { store, config }
    }

    pub async fn wait_for_reply(
        &self,
        owner_id: &str,
        conversation_id: &str,
        sent_text: &str,
        cancel: CancellationToken,
    ) -> Result<PollOutcome> {
        let mut watch = PollWatch::new(sent_text, &self.config);
        let interval = Duration::from_secs_f64(self.config.interval_s.max(0.1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("poll cancelled: conversation={conversation_id}");
                    return Ok(PollOutcome::Cancelled);
                }
                _ = tokio::time::sleep(interval) => {}
            }
            let decision = match self.store.get_conversation(owner_id, conversation_id) {
                Ok(Some(record)) => watch.observe_messages(&record.messages),
                // 会话被删除按失败处理，连续超限即终止。
                Ok(None) => watch.observe_failure(),
                Err(err) => {
                    warn!("poll fetch failed: conversation={conversation_id}, error={err}");
                    watch.observe_failure()
                }
            };
            if let PollDecision::Stop(outcome) = decision {
                return Ok(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: Role, content: &str) -> MessageRecord {
        MessageRecord {
            role,
            content: content.to_string(),
            timestamp: 0.0,
        }
    }

    fn config(max_attempts: u32, max_fetch_failures: u32) -> PollingConfig {
        PollingConfig {
            interval_s: 2.0,
            max_attempts,
            max_fetch_failures,
        }
    }

    #[test]
    fn stops_at_first_fetch_showing_the_complete_pair() {
        let mut watch = PollWatch::new("question", &config(90, 5));
        let before = vec![message(Role::User, "question")];
        assert_eq!(watch.observe_messages(&before), PollDecision::Continue);

        let after = vec![
            message(Role::User, "question"),
            message(Role::Assistant, "answer"),
        ];
        assert_eq!(
            watch.observe_messages(&after),
            PollDecision::Stop(PollOutcome::ReplyReceived {
                reply: "answer".to_string()
            })
        );
    }

    #[test]
    fn earlier_pairs_do_not_satisfy_the_stop_condition() {
        // 历史里已有别的 user→assistant 配对，但末尾的 user 文本不匹配。
        let history = vec![
            message(Role::User, "earlier"),
            message(Role::Assistant, "earlier reply"),
            message(Role::User, "new question"),
        ];
        let mut watch = PollWatch::new("new question", &config(90, 5));
        assert_eq!(watch.observe_messages(&history), PollDecision::Continue);
    }

    #[test]
    fn trailing_assistant_without_matching_user_does_not_stop() {
        let messages = vec![
            message(Role::User, "someone else's question"),
            message(Role::Assistant, "their answer"),
        ];
        let mut watch = PollWatch::new("my question", &config(90, 5));
        assert_eq!(watch.observe_messages(&messages), PollDecision::Continue);
    }

    #[test]
    fn times_out_after_max_attempts() {
        let mut watch = PollWatch::new("question", &config(3, 5));
        let messages = vec![message(Role::User, "question")];
        assert_eq!(watch.observe_messages(&messages), PollDecision::Continue);
        assert_eq!(watch.observe_messages(&messages), PollDecision::Continue);
        assert_eq!(
            watch.observe_messages(&messages),
            PollDecision::Stop(PollOutcome::TimedOut { attempts: 3 })
        );
    }

    #[test]
    fn consecutive_failures_terminate() {
        let mut watch = PollWatch::new("question", &config(90, 3));
        assert_eq!(watch.observe_failure(), PollDecision::Continue);
        assert_eq!(watch.observe_failure(), PollDecision::Continue);
        assert_eq!(
            watch.observe_failure(),
            PollDecision::Stop(PollOutcome::Failed {
                consecutive_failures: 3
            })
        );
    }

    #[test]
    fn successful_fetch_resets_failure_streak() {
        let mut watch = PollWatch::new("question", &config(90, 3));
        let messages = vec![message(Role::User, "question")];
        assert_eq!(watch.observe_failure(), PollDecision::Continue);
        assert_eq!(watch.observe_failure(), PollDecision::Continue);
        assert_eq!(watch.observe_messages(&messages), PollDecision::Continue);
        // 计数已清零，再失败两次仍可继续。
        assert_eq!(watch.observe_failure(), PollDecision::Continue);
        assert_eq!(watch.observe_failure(), PollDecision::Continue);
    }

    #[test]
    fn short_message_lists_are_tolerated() {
        let mut watch = PollWatch::new("question", &config(90, 5));
        assert_eq!(watch.observe_messages(&[]), PollDecision::Continue);
        let single = vec![message(Role::Assistant, "orphan")];
        assert_eq!(watch.observe_messages(&single), PollDecision::Continue);
    }

    #[test]
    fn same_observations_yield_same_decisions() {
        let messages = vec![
            message(Role::User, "q"),
            message(Role::Assistant, "a"),
        ];
        let mut first = PollWatch::new("q", &config(10, 5));
        let mut second = PollWatch::new("q", &config(10, 5));
        assert_eq!(
            first.observe_messages(&messages),
            second.observe_messages(&messages)
        );
    }
}
