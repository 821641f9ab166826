//! Request/response plumbing for devices driven through blocking I/O.
//!
//! The handler lives on a single blocking thread and sees one command at a
//! time; async callers hold a cloneable [`CommandSender`] and await the reply.

use std::{io, sync::mpsc};

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A request a blocking device handler knows how to answer.
pub trait Command: Send {
    type Response: Send;
    type Handler: DeviceHandler<Command = Self>;

    fn execute(self, handler: &mut Self::Handler) -> io::Result<Self::Response>;
}

pub trait DeviceHandler {
    type Command: Command<Handler = Self>;
}

type Reply<C> = oneshot::Sender<io::Result<<C as Command>::Response>>;

/// A queued command together with the slot its answer goes to.
struct Request<C: Command> {
    command: C,
    reply: Reply<C>,
}

impl<C: Command> Request<C> {
    /// The caller gave up waiting, e.g. its timeout fired while the request
    /// was still queued.
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Runs the command and hands the result back to the caller. Fails only
    /// when the caller stopped waiting.
    fn answer(self, handler: &mut C::Handler) -> io::Result<()> {
        let result = self.command.execute(handler);
        self.reply
            .send(result)
            .map_err(|_| io::Error::other("Response receiver dropped"))
    }
}

/// Owns a device handler and runs its commands in arrival order. The loop
/// ends once every [`CommandSender`] is gone.
pub struct CommandExecutor<H: DeviceHandler + Send + 'static> {
    handler: H,
    requests: mpsc::Receiver<Request<H::Command>>,
}

impl<H: DeviceHandler + Send + 'static> CommandExecutor<H> {
    pub fn new(handler: H) -> (Self, CommandSender<H::Command>) {
        let (sender, requests) = mpsc::channel();
        (Self { handler, requests }, CommandSender { requests: sender })
    }

    pub fn run(&mut self) -> io::Result<()> {
        let mut handled = 0usize;
        for request in self.requests.iter() {
            if request.is_abandoned() {
                debug!("Skipping command whose caller stopped waiting");
                continue;
            }
            handled += 1;
            if let Err(e) = request.answer(&mut self.handler) {
                warn!("Dropping command response: {}", e);
            }
        }

        debug!("All command senders dropped after {} commands", handled);
        Ok(())
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<io::Result<()>> {
        tokio::task::spawn_blocking(move || self.run())
    }
}

pub struct CommandSender<C: Command> {
    requests: mpsc::Sender<Request<C>>,
}

impl<C: Command> Clone for CommandSender<C> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<C: Command> CommandSender<C> {
    pub async fn send_command(&self, command: C) -> io::Result<C::Response> {
        let (reply, answer) = oneshot::channel();

        self.requests
            .send(Request { command, reply })
            .map_err(|_| io::Error::other("Command executor is not running"))?;

        answer
            .await
            .map_err(|_| io::Error::other("Command executor dropped the request"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        total: i64,
    }

    enum CounterCommand {
        Add(i64),
        Fail,
    }

    impl DeviceHandler for Counter {
        type Command = CounterCommand;
    }

    impl Command for CounterCommand {
        type Response = i64;
        type Handler = Counter;

        fn execute(self, handler: &mut Counter) -> io::Result<i64> {
            match self {
                CounterCommand::Add(n) => {
                    handler.total += n;
                    Ok(handler.total)
                }
                CounterCommand::Fail => Err(io::Error::other("device refused")),
            }
        }
    }

    #[tokio::test]
    async fn commands_run_in_order_on_the_handler() {
        let (executor, sender) = CommandExecutor::new(Counter::default());
        let handle = executor.spawn();

        assert_eq!(sender.send_command(CounterCommand::Add(2)).await.unwrap(), 2);
        assert_eq!(sender.send_command(CounterCommand::Add(5)).await.unwrap(), 7);

        let err = sender.send_command(CounterCommand::Fail).await.unwrap_err();
        assert_eq!(err.to_string(), "device refused");

        drop(sender);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn abandoned_commands_are_not_executed() {
        let (executor, sender) = CommandExecutor::new(Counter::default());

        // Nothing runs the queue yet, so the caller gives up while queued.
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            sender.send_command(CounterCommand::Add(100)),
        )
        .await;
        assert!(abandoned.is_err());

        let handle = executor.spawn();
        assert_eq!(sender.send_command(CounterCommand::Add(1)).await.unwrap(), 1);

        drop(sender);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sending_after_executor_stopped_fails() {
        let (executor, sender) = CommandExecutor::new(Counter::default());
        drop(executor);

        assert!(sender.send_command(CounterCommand::Add(1)).await.is_err());
    }
}
