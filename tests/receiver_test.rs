mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, oneshot, Semaphore};
    use tto::receiver::{ReceiverConfig, ReceiverLoop};
    use tto::registry::{LockedRegistry, LATEST_DUMP, LATEST_RESTORE};
    use tto::signal::Termination;
    use tto::transport::LocalRunner;
    use tto::watch::WatchEvent;

    fn registry(tmp: &TempDir) -> LockedRegistry<LocalRunner> {
        LockedRegistry::new(Arc::new(LocalRunner::new()), dir_string(tmp.path()))
    }

    async fn wait_for_content(path: &Path) -> String {
        loop {
            let content = read(path);
            if !content.is_empty() {
                return content;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn stop_on(rx: oneshot::Receiver<()>) -> impl std::future::Future<Output = Termination> {
        async move {
            let _ = rx.await;
            Termination::Interrupted
        }
    }

    #[tokio::test]
    async fn test_events_during_restore_are_coalesced() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let dump = dump_at("orders", 0);
        let reg = registry(&tmp);
        reg.ensure_layout().await?;
        std::fs::write(tmp.path().join(dump.file_name()), "SELECT 1;\n")?;
        write_marker(tmp.path(), LATEST_DUMP, &dump.to_string());

        let gate = Arc::new(Semaphore::new(0));
        let restorer = Arc::new(RecordingRestorer::gated(Arc::clone(&gate)));
        let receiver = ReceiverLoop::new(reg, Arc::clone(&restorer), ReceiverConfig::default());
        receiver.startup().await?;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle =
            tokio::spawn(async move { receiver.run(&mut events, stop_on(stop_rx)).await });

        events_tx.send(WatchEvent::Written)?;
        restorer.started.notified().await;
        events_tx.send(WatchEvent::Written)?;
        events_tx.send(WatchEvent::Written)?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        gate.add_permits(1);

        let restored = tokio::time::timeout(
            Duration::from_secs(10),
            wait_for_content(&tmp.path().join(LATEST_RESTORE)),
        )
        .await?;
        assert_eq!(restored, format!("{dump}\n"));

        let _ = stop_tx.send(());
        let term = handle.await??;
        assert_eq!(term, Termination::Interrupted);
        assert_eq!(restorer.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_new_dump_after_restore_is_applied() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let reg = registry(&tmp);
        reg.ensure_layout().await?;
        let restorer = Arc::new(RecordingRestorer::default());
        let receiver = ReceiverLoop::new(reg, Arc::clone(&restorer), ReceiverConfig::default());

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle =
            tokio::spawn(async move { receiver.run(&mut events, stop_on(stop_rx)).await });

        for hour in 0..2 {
            let dump = dump_at("orders", hour);
            std::fs::write(tmp.path().join(dump.file_name()), format!("SELECT {hour};\n"))?;
            write_marker(tmp.path(), LATEST_DUMP, &dump.to_string());
            events_tx.send(WatchEvent::Written)?;

            let expected = format!("{dump}\n");
            tokio::time::timeout(Duration::from_secs(10), async {
                while read(tmp.path().join(LATEST_RESTORE)) != expected {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await?;
        }

        let _ = stop_tx.send(());
        handle.await??;
        assert_eq!(restorer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *restorer.statements.lock().unwrap(),
            vec!["SELECT 0;".to_string(), "SELECT 1;".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_mismatched_dump_stops_loop() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let reg = registry(&tmp);
        reg.ensure_layout().await?;
        write_marker(tmp.path(), LATEST_DUMP, "billing-20240101000000.sql");
        let restorer = Arc::new(RecordingRestorer::default());
        let receiver = ReceiverLoop::new(reg, Arc::clone(&restorer), ReceiverConfig::default());

        let (events_tx, mut events) = mpsc::unbounded_channel();
        events_tx.send(WatchEvent::Written)?;
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            receiver.run(&mut events, std::future::pending()),
        )
        .await?;

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(restorer.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_watcher_is_an_error() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let receiver = ReceiverLoop::new(
            registry(&tmp),
            Arc::new(RecordingRestorer::default()),
            ReceiverConfig::default(),
        );

        let (events_tx, mut events) = mpsc::unbounded_channel::<WatchEvent>();
        drop(events_tx);
        assert!(receiver.run(&mut events, std::future::pending()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_replaced_events_are_ignored() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let reg = registry(&tmp);
        reg.ensure_layout().await?;
        write_marker(tmp.path(), LATEST_DUMP, "orders-20240101000000.sql");
        touch(tmp.path(), "orders-20240101000000.sql");
        let restorer = Arc::new(RecordingRestorer::default());
        let receiver = ReceiverLoop::new(reg, Arc::clone(&restorer), ReceiverConfig::default());

        let (events_tx, mut events) = mpsc::unbounded_channel();
        events_tx.send(WatchEvent::Replaced)?;
        drop(events_tx);

        // The loop drains the replace event, then stops on the closed channel.
        assert!(receiver.run(&mut events, std::future::pending()).await.is_err());
        assert_eq!(restorer.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
