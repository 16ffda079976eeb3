use onionpath_common::{OnionError, Result};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct SendState {
    window: u32,
    closed: bool,
}

/// Outbound window: one unit per DATA cell, refilled by SENDME.
///
/// An exhausted window parks senders until the peer acknowledges.
#[derive(Debug)]
pub struct SendWindow {
    state: Mutex<SendState>,
    start: u32,
    increment: u32,
    notify: Notify,
}

impl SendWindow {
    pub fn new(start: u32, increment: u32) -> Self {
        Self {
            state: Mutex::new(SendState {
                window: start,
                closed: false,
            }),
            start,
            increment,
            notify: Notify::new(),
        }
    }

    pub fn value(&self) -> u32 {
        self.state.lock().map(|s| s.window).unwrap_or(0)
    }

    /// Take one unit, waiting while the window is empty
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self
                    .state
                    .lock()
                    .map_err(|_| OnionError::internal("send window lock poisoned"))?;
                if state.closed {
                    return Err(OnionError::CircuitClosed);
                }
                if state.window > 0 {
                    state.window -= 1;
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Apply a SENDME; a window that would pass its start value is a protocol violation
    pub fn on_sendme(&self) -> Result<()> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| OnionError::internal("send window lock poisoned"))?;
            if state.window + self.increment > self.start {
                return Err(OnionError::protocol(format!(
                    "unexpected SENDME with window at {}",
                    state.window
                )));
            }
            state.window += self.increment;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Return a unit taken by `acquire` for a cell that was never sent
    pub fn release(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.window = (state.window + 1).min(self.start);
        }
        self.notify.notify_waiters();
    }

    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_waiters();
    }
}

/// Inbound window: tells the caller when a SENDME is owed
#[derive(Debug)]
pub struct ReceiveWindow {
    window: Mutex<u32>,
    start: u32,
    increment: u32,
}

impl ReceiveWindow {
    pub fn new(start: u32, increment: u32) -> Self {
        Self {
            window: Mutex::new(start),
            start,
            increment,
        }
    }

    pub fn value(&self) -> u32 {
        self.window.lock().map(|w| *w).unwrap_or(0)
    }

    /// Count one DATA cell; `Ok(true)` means a SENDME must be sent now
    pub fn on_data(&self) -> Result<bool> {
        let mut window = self
            .window
            .lock()
            .map_err(|_| OnionError::internal("receive window lock poisoned"))?;
        if *window == 0 {
            return Err(OnionError::protocol("peer exceeded the receive window"));
        }
        *window -= 1;
        if *window <= self.start - self.increment {
            *window += self.increment;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_window_blocks_until_sendme() {
        let window = Arc::new(SendWindow::new(2, 2));
        window.acquire().await.unwrap();
        window.acquire().await.unwrap();
        assert_eq!(window.value(), 0);

        let blocked = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        window.on_sendme().unwrap();
        blocked.await.unwrap().unwrap();
        assert_eq!(window.value(), 1);
    }

    #[tokio::test]
    async fn test_sendme_never_exceeds_start() {
        let window = SendWindow::new(1000, 100);
        assert!(window.on_sendme().is_err());
        assert_eq!(window.value(), 1000);

        for _ in 0..100 {
            window.acquire().await.unwrap();
        }
        window.on_sendme().unwrap();
        assert_eq!(window.value(), 1000);
    }

    #[tokio::test]
    async fn test_close_releases_blocked_sender() {
        let window = Arc::new(SendWindow::new(0, 1));
        let blocked = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.close();
        assert!(matches!(
            blocked.await.unwrap(),
            Err(OnionError::CircuitClosed)
        ));
    }

    #[tokio::test]
    async fn test_release_returns_an_unused_unit() {
        let window = SendWindow::new(2, 1);
        window.acquire().await.unwrap();
        window.release();
        assert_eq!(window.value(), 2);

        window.release();
        assert_eq!(window.value(), 2);
    }

    #[test]
    fn test_receive_window_owes_sendme_every_increment() {
        let window = ReceiveWindow::new(1000, 100);
        let owed: Vec<usize> = (1..=300)
            .filter(|_| window.on_data().unwrap())
            .collect();
        assert_eq!(owed, vec![100, 200, 300]);
        assert_eq!(window.value(), 1000);
    }

    #[test]
    fn test_single_unit_window_is_restored() {
        let window = ReceiveWindow::new(1, 1);
        assert!(window.on_data().unwrap());
        assert_eq!(window.value(), 1);
    }
}
