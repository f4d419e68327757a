//! 编排器：命令通道与后台主控循环
//!
//! 传输层只持有命令发送端（Submit/Cancel/Quit）与结果接收端。每个 Submit 在独立任务中运行，
//! 因此 Cancel 可以在对话进行中被处理。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::{Engine, EngineError};

/// 从传输层发往编排器的命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 提交用户输入，开始一轮对话
    Submit(String),
    /// 取消在途对话
    Cancel,
    /// 退出
    Quit,
}

/// 一轮对话的结果
#[derive(Debug)]
pub struct TurnOutcome {
    pub input: String,
    pub result: Result<String, EngineError>,
}

/// 启动主控循环：返回命令发送端与结果接收端
pub fn spawn_engine(
    engine: Arc<Engine>,
) -> (
    mpsc::UnboundedSender<Command>,
    mpsc::UnboundedReceiver<TurnOutcome>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<TurnOutcome>();

    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Submit(input) => {
                    let engine = engine.clone();
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let result = engine.submit(&input).await;
                        let _ = out_tx.send(TurnOutcome { input, result });
                    });
                }
                Command::Cancel => engine.cancel(),
                Command::Quit => {
                    engine.shutdown();
                    break;
                }
            }
        }
        tracing::debug!("Orchestrator loop exited");
    });

    (cmd_tx, out_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::core::DispatchLimits;
    use crate::memory::Message;
    use crate::react::ReasoningStep;
    use crate::tools::CapabilityRegistry;

    struct SlowStep;

    #[async_trait]
    impl ReasoningStep for SlowStep {
        async fn step(&self, _context: &[Message]) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("<final_answer>late</final_answer>".to_string())
        }
    }

    struct QuickStep;

    #[async_trait]
    impl ReasoningStep for QuickStep {
        async fn step(&self, context: &[Message]) -> Result<String, String> {
            let last = context.last().map(|m| m.content.as_str()).unwrap_or("");
            Ok(format!("<final_answer>{last}</final_answer>"))
        }
    }

    fn engine(step: Arc<dyn ReasoningStep>) -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(CapabilityRegistry::builder().build()),
            step,
            DispatchLimits::default(),
        ))
    }

    #[tokio::test]
    async fn test_submit_produces_outcome() {
        let (tx, mut rx) = spawn_engine(engine(Arc::new(QuickStep)));
        tx.send(Command::Submit("ping".to_string())).unwrap();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.input, "ping");
        assert_eq!(outcome.result.unwrap(), "ping");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_turn() {
        let (tx, mut rx) = spawn_engine(engine(Arc::new(SlowStep)));
        tx.send(Command::Submit("wait".to_string())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(Command::Cancel).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.result.unwrap_err(), EngineError::Cancelled);
    }
}
