//! Lock script inspector - 複数ワーカにコマンドを逐次発行してロックの挙動を観察
//!
//! # スクリプト
//! ```text
//! # comment
//! 1:LOCK:1:1        worker 1: min_pending_id_for_update(w=1, d=1)
//! 2:LOCK:1:1        worker 2: blocks until worker 1 ends its transaction
//! 1:DEL:1:1:2101
//! 1:C               commit
//! S:2               driver sleeps 2 seconds
//! ```
//!
//! ワーカごとに tokio タスクとトランザクションを 1 つずつ持ちます。
//! 行と行の間で `step_delay` だけ待つので、ブロックした様子がログの順序に現れます。
//! ログはすべて 1 本のチャネルを通るので、出力順 = 発生順です。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::{CourierError, DistrictId, OrderId, Partition, PendingItem, WarehouseId};
use crate::ports::{QueueStore, StoreTx};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}: {text}")]
pub struct ScriptError {
    pub line: usize,
    pub text: String,
    pub reason: String,
}

/// A store operation run inside the worker's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    Min(Partition),
    Lock(Partition),
    Delete(PendingItem),
    Insert(PendingItem),
}

impl Statement {
    fn keyword(self) -> &'static str {
        match self {
            Statement::Min(_) => "MIN",
            Statement::Lock(_) => "LOCK",
            Statement::Delete(_) => "DEL",
            Statement::Insert(_) => "INS",
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Min(p) | Statement::Lock(p) => {
                write!(f, "{}:{}:{}", self.keyword(), p.warehouse_id, p.district_id)
            }
            Statement::Delete(item) | Statement::Insert(item) => write!(
                f,
                "{}:{}:{}:{}",
                self.keyword(),
                item.warehouse_id,
                item.district_id,
                item.order_id
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOp {
    Run(Statement),
    Commit,
    Rollback,
    Exit,
}

impl fmt::Display for WorkerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerOp::Run(statement) => write!(f, "{statement}"),
            WorkerOp::Commit => f.write_str("C"),
            WorkerOp::Rollback => f.write_str("R"),
            WorkerOp::Exit => f.write_str("E"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCommand {
    /// Driver-side pause; no worker involved.
    Sleep(Duration),
    Worker { worker: u32, op: WorkerOp },
}

impl fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptCommand::Sleep(d) => write!(f, "S:{}", d.as_secs()),
            ScriptCommand::Worker { worker, op } => write!(f, "{worker}:{op}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockScript {
    commands: Vec<ScriptCommand>,
}

impl LockScript {
    pub fn parse(source: &str) -> Result<Self, ScriptError> {
        let mut commands = Vec::new();
        for (index, raw) in source.lines().enumerate() {
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let command = parse_line(text).map_err(|reason| ScriptError {
                line: index + 1,
                text: text.to_string(),
                reason,
            })?;
            commands.push(command);
        }
        Ok(Self { commands })
    }

    pub fn commands(&self) -> &[ScriptCommand] {
        &self.commands
    }
}

fn parse_line(text: &str) -> Result<ScriptCommand, String> {
    let columns: Vec<&str> = text.split(':').map(str::trim).collect();

    if columns[0] == "S" {
        let [_, secs] = columns.as_slice() else {
            return Err("expected S:<secs>".to_string());
        };
        let secs: u64 = secs.parse().map_err(|_| format!("invalid seconds '{secs}'"))?;
        return Ok(ScriptCommand::Sleep(Duration::from_secs(secs)));
    }

    let worker: u32 = columns[0]
        .parse()
        .map_err(|_| format!("invalid worker id '{}'", columns[0]))?;
    let Some(keyword) = columns.get(1) else {
        return Err("missing command".to_string());
    };
    let args = &columns[2..];

    let op = match *keyword {
        "MIN" => WorkerOp::Run(Statement::Min(partition_arg(args, keyword)?)),
        "LOCK" => WorkerOp::Run(Statement::Lock(partition_arg(args, keyword)?)),
        "DEL" => WorkerOp::Run(Statement::Delete(item_arg(args, keyword)?)),
        "INS" => WorkerOp::Run(Statement::Insert(item_arg(args, keyword)?)),
        "C" | "R" | "E" if !args.is_empty() => {
            return Err(format!("{keyword} takes no arguments"));
        }
        "C" => WorkerOp::Commit,
        "R" => WorkerOp::Rollback,
        "E" => WorkerOp::Exit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(ScriptCommand::Worker { worker, op })
}

fn int_arg(value: &str) -> Result<i32, String> {
    value.parse().map_err(|_| format!("invalid number '{value}'"))
}

fn partition_arg(args: &[&str], keyword: &str) -> Result<Partition, String> {
    let [w, d] = args else {
        return Err(format!("expected {keyword}:<w>:<d>"));
    };
    Ok(Partition::new(
        WarehouseId::new(int_arg(w)?),
        DistrictId::new(int_arg(d)?),
    ))
}

fn item_arg(args: &[&str], keyword: &str) -> Result<PendingItem, String> {
    let [w, d, o] = args else {
        return Err(format!("expected {keyword}:<w>:<d>:<o>"));
    };
    let partition = Partition::new(WarehouseId::new(int_arg(w)?), DistrictId::new(int_arg(d)?));
    Ok(partition.item(OrderId::new(int_arg(o)?)))
}

/// Runs a `LockScript` against a store and returns the transcript.
pub struct LockInspector {
    store: Arc<dyn QueueStore>,
    step_delay: Duration,
}

struct ScriptWorker {
    ops: mpsc::UnboundedSender<WorkerOp>,
    join: JoinHandle<()>,
}

impl LockInspector {
    pub const DEFAULT_STEP_DELAY: Duration = Duration::from_secs(1);

    pub fn new(store: Arc<dyn QueueStore>, step_delay: Duration) -> Self {
        Self { store, step_delay }
    }

    pub async fn run(&self, script: &LockScript) -> Vec<String> {
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
        let logger = tokio::spawn(async move {
            let mut transcript = Vec::new();
            while let Some(line) = log_rx.recv().await {
                info!(target: "courier::inspect", "{line}");
                transcript.push(line);
            }
            transcript
        });

        let mut workers: BTreeMap<u32, ScriptWorker> = BTreeMap::new();
        for command in script.commands() {
            match *command {
                ScriptCommand::Sleep(pause) => {
                    let _ = log_tx.send(command.to_string());
                    tokio::time::sleep(pause).await;
                    let _ = log_tx.send("(S)".to_string());
                }
                ScriptCommand::Worker { worker, op } => {
                    let handle = workers.entry(worker).or_insert_with(|| {
                        ScriptWorker::spawn(worker, Arc::clone(&self.store), log_tx.clone())
                    });
                    // a worker that aborted or exited ignores the rest of its lines
                    let _ = handle.ops.send(op);
                }
            }
            tokio::time::sleep(self.step_delay).await;
        }

        for worker in workers.values() {
            let _ = worker.ops.send(WorkerOp::Exit);
        }
        for (id, worker) in workers {
            if let Err(err) = worker.join.await {
                warn!(worker = id, error = %err, "Script worker did not finish cleanly");
            }
        }

        drop(log_tx);
        match logger.await {
            Ok(transcript) => transcript,
            Err(err) => {
                warn!(error = %err, "Transcript logger did not finish cleanly");
                Vec::new()
            }
        }
    }
}

impl ScriptWorker {
    fn spawn(id: u32, store: Arc<dyn QueueStore>, log: mpsc::UnboundedSender<String>) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(script_worker(id, store, rx, log));
        Self { ops, join }
    }
}

async fn script_worker(
    id: u32,
    store: Arc<dyn QueueStore>,
    mut ops: mpsc::UnboundedReceiver<WorkerOp>,
    log: mpsc::UnboundedSender<String>,
) {
    // dropped (rolled back) on exit or abort
    let mut tx: Option<Box<dyn StoreTx>> = None;

    while let Some(op) = ops.recv().await {
        let _ = log.send(format!("{id}:{op}"));

        let result = match op {
            WorkerOp::Exit => break,
            WorkerOp::Commit => match tx.take() {
                Some(open) => open.commit().await.map(|()| None),
                None => Ok(None),
            },
            WorkerOp::Rollback => match tx.take() {
                Some(open) => open.rollback().await.map(|()| None),
                None => Ok(None),
            },
            WorkerOp::Run(statement) => run_statement(store.as_ref(), &mut tx, statement)
                .await
                .map(|outcome| Some(format!("({id}:{}:{outcome})", statement.keyword()))),
        };

        match result {
            Ok(Some(line)) => {
                let _ = log.send(line);
            }
            Ok(None) => {}
            Err(err) => {
                let _ = log.send(format!("({id}:{err})"));
                let _ = log.send(format!("{id}:ABORT"));
                break;
            }
        }
    }
}

/// Execute `statement`, beginning a transaction first if none is open.
async fn run_statement(
    store: &dyn QueueStore,
    slot: &mut Option<Box<dyn StoreTx>>,
    statement: Statement,
) -> Result<String, CourierError> {
    let mut tx = match slot.take() {
        Some(tx) => tx,
        None => store.begin().await?,
    };

    let outcome = match statement {
        Statement::Min(p) => min_text(tx.min_pending_id(p).await?),
        Statement::Lock(p) => min_text(tx.min_pending_id_for_update(p).await?),
        Statement::Delete(item) => {
            let count = tx.delete_item(item.partition(), item.order_id).await?;
            format!("COUNT={count}")
        }
        Statement::Insert(item) => {
            tx.insert_item(item).await?;
            "COUNT=1".to_string()
        }
    };

    *slot = Some(tx);
    Ok(outcome)
}

fn min_text(min: Option<OrderId>) -> String {
    match min {
        Some(order_id) => format!("MIN={order_id}"),
        None => "MIN=NULL".to_string(),
    }
}
