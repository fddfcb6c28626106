//! Dead peer detection and read deadline timers

use crate::protocol::{Payload, PayloadType};
use crate::session::ConnSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Lower bound of the DPD interval, in seconds
pub const MIN_DPD_INTERVAL: u32 = 10;
/// Margin kept below the gateway's DPD interval
const DPD_MARGIN: u32 = 5;
/// Slack added to the DPD interval for read deadlines
pub const READ_DEADLINE_SLACK: u64 = 5;

/// DPD request interval in seconds: the smaller non-zero gateway interval
/// minus five seconds, never below ten
pub fn compute_dpd_interval(tls_dpd: u32, dtls_dpd: u32) -> u32 {
    let smallest = [tls_dpd, dtls_dpd].into_iter().filter(|d| *d > 0).min();
    match smallest {
        Some(dpd) => dpd.saturating_sub(DPD_MARGIN).max(MIN_DPD_INTERVAL),
        None => MIN_DPD_INTERVAL,
    }
}

/// Read deadline of a channel given its DPD interval
pub fn read_deadline(dpd: u32) -> Duration {
    Duration::from_secs(dpd as u64 + READ_DEADLINE_SLACK)
}

/// Send a DPD request on every live channel each interval. Full queues drop it.
pub fn spawn_dpd_timer(cs: Arc<ConnSession>) -> JoinHandle<()> {
    let secs = compute_dpd_interval(cs.tls_dpd_time, cs.dtls_dpd_time);
    log::debug!(
        "TLS DPD {} keepalive {}, DTLS DPD {} keepalive {}, probing every {secs}s",
        cs.tls_dpd_time,
        cs.tls_keepalive_time,
        cs.dtls_dpd_time,
        cs.dtls_keepalive_time
    );
    let period = Duration::from_secs(secs as u64);

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cs.close_token().cancelled() => break,
                _ = ticker.tick() => {
                    let _ = cs
                        .payload_out_tls
                        .sender()
                        .try_send(Payload::control(PayloadType::DpdRequest));
                    if cs.is_dtls_connected() {
                        let _ = cs
                            .payload_out_dtls
                            .sender()
                            .try_send(Payload::control(PayloadType::DpdRequest));
                    }
                }
            }
        }
        log::info!("Dead peer detection timer exit");
    })
}

/// Periodically ask the read pumps to push their deadline forward
pub fn spawn_read_deadline_timer(cs: Arc<ConnSession>, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cs.close_token().cancelled() => break,
                _ = ticker.tick() => {
                    if cs.is_closed() {
                        break;
                    }
                    cs.request_deadline_reset();
                }
            }
        }
        log::info!("Read deadline timer exit");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{endpoint, params};
    use crate::session::Session;

    #[test]
    fn test_dpd_interval() {
        assert_eq!(compute_dpd_interval(0, 0), 10);
        assert_eq!(compute_dpd_interval(30, 0), 25);
        assert_eq!(compute_dpd_interval(0, 40), 35);
        assert_eq!(compute_dpd_interval(30, 90), 25);
        assert_eq!(compute_dpd_interval(12, 0), 10);
        assert_eq!(compute_dpd_interval(3, 0), 10);
        for tls in [0u32, 1, 5, 14, 15, 16, 60, 300] {
            for dtls in [0u32, 2, 15, 20, 90] {
                assert!(compute_dpd_interval(tls, dtls) >= 10);
            }
        }
    }

    #[test]
    fn test_read_deadline() {
        assert_eq!(read_deadline(30), Duration::from_secs(35));
        assert_eq!(read_deadline(0), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dpd_timer_fills_tls_queue() {
        let session = Session::new();
        let cs = session.new_conn_session_with_capacity(endpoint(), params(), 2);
        let mut rx = cs.payload_out_tls.take_receiver().unwrap();

        let handle = spawn_dpd_timer(cs.clone());
        // tls_dpd 30 gives a 25 second period; queue of two drops the surplus
        tokio::time::sleep(Duration::from_secs(25 * 4 + 1)).await;
        assert_eq!(rx.recv().await.unwrap().ptype, PayloadType::DpdRequest);
        assert_eq!(rx.recv().await.unwrap().ptype, PayloadType::DpdRequest);
        assert!(rx.try_recv().is_err());
        assert!(cs.payload_out_dtls.take_receiver().unwrap().try_recv().is_err());

        cs.close();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_timer_sets_flags() {
        let session = Session::new();
        let cs = session.new_conn_session(endpoint(), params());
        assert!(cs.take_tls_deadline_reset());
        assert!(cs.take_dtls_deadline_reset());

        let handle = spawn_read_deadline_timer(cs.clone(), Duration::from_secs(4));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(cs.take_tls_deadline_reset());
        assert!(cs.take_dtls_deadline_reset());

        cs.close();
        handle.await.unwrap();
    }
}
