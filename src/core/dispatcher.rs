//! 调度器：指令派发主循环
//!
//! 对任务 T 的每次推理输出：
//! 解析 -> 无指令则交给终态校验（不合格时重新提示）-> 有指令则逐条解析目标、创建子任务 ->
//! 本轮子任务并发运行（Agent 递归进入同一循环，Tool 单次调用）-> 全部返回后按指令原文顺序
//! 折回 T 的上下文 -> 再次推理。
//!
//! 任务树只在这里被修改，所有修改都经由 `update` 串行执行；锁从不跨越 await。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{self, join_all, BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSection;
use crate::core::task_tree::{FailureReason, TaskStatus, TaskTree, TreeFault};
use crate::core::{
    DirectiveError, EngineError, RecoveryAction, RecoveryEngine, TaskId, TaskScheduler,
};
use crate::memory::{DirectiveOrigin, Message};
use crate::protocol::{Directive, ParsedBlock};
use crate::react::{DispatchEvent, ReasoningStep};
use crate::tools::{
    CapabilityDescriptor, CapabilityRegistry, Handler, InvocationContext, Role, ToolExecutor,
};

/// 推理输出预览最大字符数
const OUTPUT_PREVIEW_CHARS: usize = 200;

/// 调度边界
#[derive(Debug, Clone)]
pub struct DispatchLimits {
    /// 最大委派深度：depth == max_depth 的子任务仍会运行，更深的直接 DepthExceeded
    pub max_depth: usize,
    /// 单个任务最多推理轮数
    pub max_rounds: usize,
    /// 终态格式错误时的重新提示次数
    pub max_format_retries: usize,
    pub max_concurrent_tools: usize,
    pub tool_timeout: Duration,
    /// 子 Agent 一次完整运行的时限
    pub agent_timeout: Duration,
    /// 单次推理步骤的时限
    pub step_timeout: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for DispatchLimits {
    fn from(cfg: &EngineSection) -> Self {
        Self {
            max_depth: cfg.max_depth,
            max_rounds: cfg.max_rounds,
            max_format_retries: cfg.max_format_retries,
            max_concurrent_tools: cfg.max_concurrent_tools,
            tool_timeout: Duration::from_secs(cfg.tool_timeout_secs),
            agent_timeout: Duration::from_secs(cfg.agent_timeout_secs),
            step_timeout: Duration::from_secs(cfg.step_timeout_secs),
        }
    }
}

type ChildResult = Result<String, DirectiveError>;

/// 指令调度器
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    tree: Mutex<TaskTree>,
    tools: ToolExecutor,
    recovery: RecoveryEngine,
    limits: DispatchLimits,
    events: Option<mpsc::UnboundedSender<DispatchEvent>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, limits: DispatchLimits) -> Self {
        Self {
            registry,
            tree: Mutex::new(TaskTree::new()),
            tools: ToolExecutor::new(
                TaskScheduler::new(limits.max_concurrent_tools),
                limits.tool_timeout,
            ),
            recovery: RecoveryEngine::new(limits.max_format_retries),
            limits,
            events: None,
        }
    }

    /// 设置事件推送通道
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// 任务树中仍存活的任务数
    pub fn live_tasks(&self) -> Result<usize, EngineError> {
        self.update(|t| Ok(t.len()))
    }

    fn emit(&self, ev: DispatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ev);
        }
    }

    /// 任务树更新操作：持锁执行闭包，锁中毒或不变式被破坏均为 DispatcherFault
    fn update<R>(
        &self,
        f: impl FnOnce(&mut TaskTree) -> Result<R, TreeFault>,
    ) -> Result<R, EngineError> {
        let mut tree = self
            .tree
            .lock()
            .map_err(|_| EngineError::DispatcherFault("task tree lock poisoned".to_string()))?;
        f(&mut tree).map_err(EngineError::from)
    }

    /// 运行一轮对话：创建根任务、驱动到终态、交付后丢弃
    pub async fn run_turn(
        &self,
        step: &dyn ReasoningStep,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        self.run_turn_after(step, &[], input, cancel).await
    }

    /// 同 run_turn，根任务上下文以 `history` 开头
    pub async fn run_turn_after(
        &self,
        step: &dyn ReasoningStep,
        history: &[Message],
        input: &str,
        cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        let root =
            self.update(|t| Ok(t.create_root_after(history.to_vec(), Message::user(input))))?;
        tracing::info!(task = %root, "turn started");

        let outcome = self.drive(root, step, cancel).await;

        let discarded = self.update(|t| {
            t.abandon(root, FailureReason::DispatcherFault)?;
            t.remove(root).map(|_| ())
        });
        match (&outcome, discarded) {
            (Ok(_), Err(fault)) => return Err(fault),
            (Err(_), Err(fault)) => tracing::error!("Failed to discard {}: {}", root, fault),
            _ => {}
        }

        match &outcome {
            Ok(answer) => tracing::info!(task = %root, chars = answer.len(), "turn completed"),
            Err(e) => tracing::warn!(task = %root, error = %e, "turn failed"),
        }
        outcome
    }

    /// 驱动一个任务直到终态；出错时将任务（及残留后代）标记为失败
    fn drive<'a>(
        &'a self,
        id: TaskId,
        step: &'a dyn ReasoningStep,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<String, EngineError>> {
        async move {
            let result = self.drive_loop(id, step, &cancel).await;
            if let Err(e) = &result {
                match self.update(|t| t.abandon(id, FailureReason::from(e))) {
                    Ok(failed) => {
                        for (task, parent) in failed {
                            self.emit(DispatchEvent::TaskFinished {
                                task,
                                parent,
                                status: TaskStatus::Failed(FailureReason::from(e)),
                            });
                        }
                    }
                    Err(fault) => tracing::error!("Failed to mark {} as failed: {}", id, fault),
                }
            }
            result
        }
        .boxed()
    }

    async fn drive_loop(
        &self,
        id: TaskId,
        step: &dyn ReasoningStep,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let (depth, parent) = self.update(|t| {
            t.transition(id, TaskStatus::Running)?;
            Ok((t.depth(id)?, t.parent(id)?))
        })?;
        let mut format_retries = 0;

        for round in 1..=self.limits.max_rounds {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.update(|t| t.check_invariants())?;
            self.emit(DispatchEvent::RoundStarted {
                task: id,
                depth,
                round,
            });

            let context = self.update(|t| t.context(id))?;
            let output = self.reason(step, &context, cancel).await?;
            tracing::debug!(task = %id, round, chars = output.len(), "reasoning output");
            self.emit(DispatchEvent::ReasoningOutput {
                task: id,
                preview: preview(&output),
            });
            self.update(|t| t.append(id, [Message::assistant(output.clone())]))?;

            let block = ParsedBlock::parse(&output);
            self.report_diagnostics(id, &block)?;

            if block.directives.is_empty() {
                match block.terminal {
                    Ok(answer) => {
                        self.update(|t| t.complete(id, answer.clone()))?;
                        self.emit(DispatchEvent::TaskFinished {
                            task: id,
                            parent,
                            status: TaskStatus::Completed,
                        });
                        tracing::debug!(task = %id, round, "task completed");
                        return Ok(answer);
                    }
                    Err(malformed) => {
                        let err = EngineError::MalformedTerminalResponse(malformed);
                        match self.recovery.handle(&err, format_retries) {
                            RecoveryAction::RetryWithPrompt(prompt) => {
                                format_retries += 1;
                                tracing::warn!(task = %id, error = %err, "re-prompting after malformed response");
                                self.emit(DispatchEvent::Recovery {
                                    task: id,
                                    action: "RetryWithPrompt".to_string(),
                                    detail: prompt.clone(),
                                });
                                self.update(|t| t.append(id, [Message::user(prompt)]))?;
                                continue;
                            }
                            RecoveryAction::Abort => return Err(err),
                        }
                    }
                }
            }

            if block.completion_markers > 0 {
                tracing::warn!(task = %id, "final answer ignored: the same reply contains directives");
                self.update(|t| {
                    t.append(
                        id,
                        [Message::system(
                            "Your <final_answer> was ignored because the same reply also contained \
                             directives. Answer again once their results are in.",
                        )],
                    )
                })?;
            }

            self.dispatch_round(id, depth, block.directives, cancel)
                .await?;
        }

        Err(EngineError::RoundLimitExceeded(self.limits.max_rounds))
    }

    /// 调用推理步骤：受 step_timeout 约束，可被取消
    async fn reason(
        &self,
        step: &dyn ReasoningStep,
        context: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let limit = self.limits.step_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            r = timeout(limit, step.step(context)) => match r {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(EngineError::ReasoningStep(e)),
                Err(_) => Err(EngineError::StepTimeout(limit.as_millis() as u64)),
            },
        }
    }

    /// 解析诊断：记录日志、推送事件，并以 system 消息告知下一轮推理
    fn report_diagnostics(&self, id: TaskId, block: &ParsedBlock) -> Result<(), EngineError> {
        if block.diagnostics.is_empty() {
            return Ok(());
        }
        let mut note = String::from(
            "Some markup in your last reply was not understood and was kept as plain text:",
        );
        for diag in &block.diagnostics {
            tracing::warn!(task = %id, "Parse diagnostic: {}", diag);
            self.emit(DispatchEvent::ParseDiagnostic {
                task: id,
                message: diag.to_string(),
            });
            note.push_str("\n- ");
            note.push_str(&diag.to_string());
        }
        self.update(|t| t.append(id, [Message::system(note)]))
    }

    /// 解析指令目标并校验角色
    fn resolve(&self, directive: &Directive) -> Result<Arc<CapabilityDescriptor>, DirectiveError> {
        let descriptor = self
            .registry
            .resolve(&directive.target)
            .map_err(|_| DirectiveError::UnknownCapability(directive.target.clone()))?;
        if !descriptor.role.accepts(directive.kind) {
            return Err(DirectiveError::RoleMismatch {
                target: directive.target.clone(),
                expected: Role::for_kind(directive.kind),
                actual: descriptor.role,
            });
        }
        Ok(descriptor)
    }

    /// 一轮派发：创建子任务、并发运行、等待全部返回（join barrier）、按原文顺序折回
    async fn dispatch_round(
        &self,
        parent: TaskId,
        depth: usize,
        directives: Vec<Directive>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.update(|t| t.transition(parent, TaskStatus::AwaitingChildren))?;

        let mut entries: Vec<(Directive, Option<TaskId>)> = Vec::with_capacity(directives.len());
        let mut jobs: Vec<BoxFuture<'_, Result<ChildResult, EngineError>>> =
            Vec::with_capacity(directives.len());

        for directive in directives {
            match self.resolve(&directive) {
                Err(err) => {
                    tracing::warn!(task = %parent, target = %directive.target, error = %err, "directive rejected");
                    self.emit(DispatchEvent::DirectiveRejected {
                        parent,
                        target: directive.target.clone(),
                        reason: err.to_string(),
                    });
                    jobs.push(future::ready(Ok(Err(err))).boxed());
                    entries.push((directive, None));
                }
                Ok(descriptor) => {
                    let child = self.update(|t| {
                        t.create_child(
                            parent,
                            &descriptor.name,
                            Message::user(directive.payload.clone()),
                        )
                    })?;
                    tracing::debug!(task = %parent, child = %child, target = %descriptor.name, "directive dispatched");
                    self.emit(DispatchEvent::DirectiveDispatched {
                        parent,
                        child,
                        target: descriptor.name.clone(),
                        kind: directive.kind,
                    });
                    jobs.push(
                        self.run_child(
                            parent,
                            child,
                            depth + 1,
                            descriptor,
                            directive.payload.clone(),
                            cancel.child_token(),
                        )
                        .boxed(),
                    );
                    entries.push((directive, Some(child)));
                }
            }
        }

        // join_all 保持输入顺序：折回顺序即指令在原文中的顺序，与完成先后无关
        let outcomes = join_all(jobs).await;
        let results = outcomes.into_iter().collect::<Result<Vec<_>, _>>()?;

        if cancel.is_cancelled() {
            // 取消时丢弃本轮的部分结果
            self.update(|t| {
                for child in entries.iter().filter_map(|(_, c)| *c) {
                    t.remove(child)?;
                }
                Ok(())
            })?;
            return Err(EngineError::Cancelled);
        }

        self.update(|t| {
            for ((directive, child), result) in entries.iter().zip(&results) {
                if let Some(child) = child {
                    t.remove(*child)?;
                }
                let (ok, body) = match result {
                    Ok(text) => (true, text.clone()),
                    Err(e) => (false, format!("error: {e}")),
                };
                let origin = DirectiveOrigin {
                    target: directive.target.clone(),
                    kind: directive.kind,
                    span: directive.span.clone(),
                    ok,
                };
                t.append(parent, [Message::directive_result(origin, &body)])?;
            }
            t.transition(parent, TaskStatus::Running)
        })
    }

    /// 运行单个子任务；指令级错误作为 Ok(Err(..)) 返回，只有 DispatcherFault 走外层 Err
    async fn run_child(
        &self,
        parent: TaskId,
        child: TaskId,
        depth: usize,
        descriptor: Arc<CapabilityDescriptor>,
        payload: String,
        cancel: CancellationToken,
    ) -> Result<ChildResult, EngineError> {
        if depth > self.limits.max_depth {
            tracing::warn!(task = %child, depth, max = self.limits.max_depth, "delegation depth exceeded");
            let result = Err(DirectiveError::DepthExceeded {
                depth,
                max: self.limits.max_depth,
            });
            self.settle_child(parent, child, &result)?;
            return Ok(result);
        }

        match &descriptor.handler {
            Handler::Tool(tool) => {
                self.update(|t| t.transition(child, TaskStatus::Running))?;
                let ctx = InvocationContext {
                    task_id: child,
                    depth,
                    target: descriptor.name.clone(),
                };
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(DirectiveError::Cancelled),
                    r = self.tools.invoke(tool.as_ref(), &payload, &ctx) => r,
                };
                self.settle_child(parent, child, &result)?;
                Ok(result)
            }
            Handler::Agent(step) => {
                let limit = self.limits.agent_timeout;
                let target = descriptor.name.clone();
                match timeout(limit, self.drive(child, step.as_ref(), cancel.clone())).await {
                    Ok(Ok(answer)) => Ok(Ok(answer)),
                    Ok(Err(e)) if e.is_fatal() => Err(e),
                    Ok(Err(EngineError::Cancelled)) => Ok(Err(DirectiveError::Cancelled)),
                    Ok(Err(EngineError::StepTimeout(after_ms))) => {
                        Ok(Err(DirectiveError::Timeout { target, after_ms }))
                    }
                    Ok(Err(e)) => Ok(Err(DirectiveError::HandlerFailed {
                        target,
                        reason: e.to_string(),
                    })),
                    Err(_) => {
                        // 嵌套循环的 future 已被丢弃：通知后代并把残留子树标记为超时
                        cancel.cancel();
                        tracing::warn!(task = %child, target = %target, "agent timed out");
                        let failed = self.update(|t| t.abandon(child, FailureReason::Timeout))?;
                        for (task, parent) in failed {
                            self.emit(DispatchEvent::TaskFinished {
                                task,
                                parent,
                                status: TaskStatus::Failed(FailureReason::Timeout),
                            });
                        }
                        Ok(Err(DirectiveError::Timeout {
                            target,
                            after_ms: limit.as_millis() as u64,
                        }))
                    }
                }
            }
        }
    }

    /// 记录叶子子任务的终态
    fn settle_child(
        &self,
        parent: TaskId,
        child: TaskId,
        result: &ChildResult,
    ) -> Result<(), EngineError> {
        let status = match result {
            Ok(text) => {
                self.update(|t| t.complete(child, text.clone()))?;
                TaskStatus::Completed
            }
            Err(e) => {
                let reason = FailureReason::from(e);
                self.update(|t| t.fail(child, reason))?;
                TaskStatus::Failed(reason)
            }
        };
        self.emit(DispatchEvent::TaskFinished {
            task: child,
            parent: Some(parent),
            status,
        });
        Ok(())
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OUTPUT_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OUTPUT_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::react::Planner;
    use crate::tools::EchoTool;

    fn registry() -> Arc<CapabilityRegistry> {
        let mut builder = CapabilityRegistry::builder();
        builder.register_tool(EchoTool).unwrap();
        Arc::new(builder.build())
    }

    fn scripted<I: IntoIterator<Item = &'static str>>(responses: I) -> Planner {
        Planner::new(Arc::new(ScriptedLlmClient::new(responses)), "test")
    }

    #[tokio::test]
    async fn test_final_answer_completes_turn() {
        let dispatcher = Dispatcher::new(registry(), DispatchLimits::default());
        let step = scripted(["<final_answer>done</final_answer>"]);
        let out = dispatcher
            .run_turn(&step, "hi", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(dispatcher.live_tasks().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tool_result_is_folded_back() {
        let dispatcher = Dispatcher::new(registry(), DispatchLimits::default());
        let llm = ScriptedLlmClient::from_fn(|ctx| match ctx.last() {
            Some(m) if m.is_directive_result() => {
                assert!(m.content.contains("status=\"ok\""));
                assert!(m.content.contains("pong"));
                "<final_answer>got pong</final_answer>".to_string()
            }
            _ => "<tool_call: echo>pong</tool_call>".to_string(),
        });
        let step = Planner::new(Arc::new(llm), "test");
        let out = dispatcher
            .run_turn(&step, "ping", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "got pong");
        assert_eq!(dispatcher.live_tasks().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_capability_is_reported_to_parent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(registry(), DispatchLimits::default()).with_events(tx);
        let llm = ScriptedLlmClient::from_fn(|ctx| match ctx.last() {
            Some(m) if m.is_directive_result() => {
                assert!(m.content.contains("status=\"error\""));
                assert!(m.content.contains("unknown capability 'nope'"));
                "<final_answer>recovered</final_answer>".to_string()
            }
            _ => "<tool_call: nope>x</tool_call>".to_string(),
        });
        let step = Planner::new(Arc::new(llm), "test");
        let out = dispatcher
            .run_turn(&step, "go", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "recovered");

        let mut rejected = 0;
        let mut dispatched = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                DispatchEvent::DirectiveRejected { .. } => rejected += 1,
                DispatchEvent::DirectiveDispatched { .. } => dispatched += 1,
                _ => {}
            }
        }
        assert_eq!((rejected, dispatched), (1, 0));
    }

    #[tokio::test]
    async fn test_malformed_terminal_response_is_retried() {
        let dispatcher = Dispatcher::new(registry(), DispatchLimits::default());
        let step = scripted(["just text", "<final_answer>ok</final_answer>"]);
        let out = dispatcher
            .run_turn(&step, "q", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "ok");
    }

    #[tokio::test]
    async fn test_round_limit() {
        let limits = DispatchLimits {
            max_rounds: 2,
            ..DispatchLimits::default()
        };
        let dispatcher = Dispatcher::new(registry(), limits);
        let llm = ScriptedLlmClient::from_fn(|_| "<tool_call: echo>again</tool_call>".to_string());
        let step = Planner::new(Arc::new(llm), "test");
        let err = dispatcher
            .run_turn(&step, "loop", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::RoundLimitExceeded(2));
        assert_eq!(dispatcher.live_tasks().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dispatcher = Dispatcher::new(registry(), DispatchLimits::default());
        let step = scripted(["<final_answer>never</final_answer>"]);
        let token = CancellationToken::new();
        token.cancel();
        let err = dispatcher.run_turn(&step, "x", token).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
        assert_eq!(dispatcher.live_tasks().unwrap(), 0);
    }

    /// 推理过程中破坏任务树，下一轮开始时应被识别为 DispatcherFault
    struct CorruptingStep(Arc<Dispatcher>);

    #[async_trait::async_trait]
    impl ReasoningStep for CorruptingStep {
        async fn step(&self, _context: &[Message]) -> Result<String, String> {
            {
                let mut tree = self.0.tree.lock().unwrap();
                let ids = tree.ids();
                assert_eq!(ids.len(), 1);
                tree.force_depth(ids[0], 5);
            }
            Ok("<tool_call: echo>x</tool_call>".to_string())
        }
    }

    #[tokio::test]
    async fn test_broken_tree_invariant_is_dispatcher_fault() {
        let dispatcher = Arc::new(Dispatcher::new(registry(), DispatchLimits::default()));
        let step = CorruptingStep(dispatcher.clone());
        let err = dispatcher
            .run_turn(&step, "x", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(&err, EngineError::DispatcherFault(msg) if msg.contains("has depth 5")));
    }

    #[test]
    fn test_poisoned_tree_lock_is_reported() {
        let dispatcher = Arc::new(Dispatcher::new(registry(), DispatchLimits::default()));
        let holder = dispatcher.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.tree.lock().unwrap();
            panic!("poisoning the task tree lock");
        })
        .join();
        assert!(matches!(
            dispatcher.live_tasks(),
            Err(EngineError::DispatcherFault(_))
        ));
    }

    #[test]
    fn test_preview_truncates() {
        let long = "y".repeat(300);
        assert!(preview(&long).ends_with("..."));
        assert_eq!(preview("short"), "short");
    }
}
