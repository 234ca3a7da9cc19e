//! Refresh orchestration: cron-aligned cycles with bounded time.
//!
//! Each cycle runs fetch-all → parse-each → capture → pack → display under
//! a 60-second deadline derived from the root shutdown handle. Per-source
//! fetch/parse failures are non-fatal; capture/pack/display failures abort
//! the cycle (the scheduler keeps going, single-shot mode exits non-zero).
//! The orchestrator exclusively owns the panel handle.

use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tracing::{error, info, warn};

use epdcal_feed::{parse_ics, Fetcher};
use epdcal_panel::{pack_planes, PanelDevice, PanelState};

use crate::capture::{capture_png, CaptureOptions};
use crate::config::{ics_cache_dir, preview_path, Config};
use crate::error::{ServerError, ServerResult};
use crate::shutdown::ShutdownHandle;

/// Whole-cycle budget.
const CYCLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Behavior switches from the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOptions {
    /// Run one cycle and exit.
    pub once: bool,
    /// Skip panel hardware entirely.
    pub render_only: bool,
    /// Write `black.bin` / `red.bin` next to the preview PNG.
    pub dump: bool,
    /// Development paths (./cache) instead of /var/lib.
    pub debug: bool,
}

/// Drives the refresh pipeline on a schedule.
pub struct Orchestrator {
    config: Config,
    options: CycleOptions,
    fetcher: Fetcher,
    panel: Option<Box<dyn PanelDevice>>,
    shutdown: ShutdownHandle,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        options: CycleOptions,
        panel: Option<Box<dyn PanelDevice>>,
        shutdown: ShutdownHandle,
    ) -> ServerResult<Self> {
        let fetcher = Fetcher::new(ics_cache_dir(options.debug))?;
        Ok(Self {
            config,
            options,
            fetcher,
            panel,
            shutdown,
        })
    }

    /// Runs a single cycle, then sleeps the panel. `--once` semantics: any
    /// pipeline failure propagates so main can exit non-zero.
    pub async fn run_once(&mut self) -> ServerResult<()> {
        let result = self.run_cycle().await;
        self.sleep_panel().await;
        result
    }

    /// Runs the cron loop until shutdown. An immediate cycle happens at
    /// startup; subsequent runs align to the wall clock in the display
    /// zone. Ticks that fire while a cycle is still running are skipped.
    pub async fn run_scheduled(&mut self) -> ServerResult<()> {
        let tz = self.config.display_tz();
        let schedule = parse_schedule(&self.config.refresh)?;

        info!(refresh = %self.config.refresh, timezone = %tz.name(), "starting refresh loop");

        if let Err(e) = self.run_cycle().await {
            if e.is_cancelled() {
                self.sleep_panel().await;
                return Ok(());
            }
            error!(error = %e, "initial refresh cycle failed");
        }

        loop {
            let now = Utc::now().with_timezone(&tz);
            let Some(fire_at) = schedule.after(&now).next() else {
                warn!("refresh schedule has no future fire times");
                break;
            };
            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.wait() => break,
            }
            if self.shutdown.is_shutdown() {
                break;
            }

            info!(tick = %fire_at.to_rfc3339(), "scheduled refresh tick");
            if let Err(e) = self.run_cycle().await {
                if e.is_cancelled() {
                    break;
                }
                error!(error = %e, "scheduled refresh cycle failed");
            }

            // Any fire times that elapsed while the cycle ran are dropped,
            // never queued.
            let after_cycle = Utc::now().with_timezone(&tz);
            let skipped = missed_ticks(&schedule, &fire_at, &after_cycle);
            if skipped > 0 {
                warn!(skipped, "refresh ticks skipped while previous cycle was running");
            }
        }

        self.sleep_panel().await;
        Ok(())
    }

    /// One full refresh cycle under the 60-second deadline.
    pub async fn run_cycle(&mut self) -> ServerResult<()> {
        let cycle = self.shutdown.child_with_deadline(CYCLE_TIMEOUT);
        let started = Instant::now();
        let sources = self.config.sources();

        info!(source_count = sources.len(), "refresh cycle start");

        if sources.is_empty() {
            info!("no ICS sources configured, skipping feed refresh");
        } else {
            let (results, errors) = tokio::select! {
                r = self.fetcher.fetch_all(&sources) => r,
                _ = cycle.wait() => return Err(ServerError::Cancelled),
            };
            for err in &errors {
                warn!(error = %err, "feed fetch failed");
            }

            let mut event_total = 0usize;
            for result in &results {
                match parse_ics(&result.source, &result.body) {
                    Ok(events) => {
                        event_total += events.len();
                        info!(
                            id = %result.source.id,
                            from_cache = result.from_cache,
                            event_count = events.len(),
                            "source refreshed"
                        );
                    }
                    Err(e) => warn!(id = %result.source.id, error = %e, "source parse failed"),
                }
            }
            info!(event_total, "feed refresh complete");
        }

        self.capture_and_display(&cycle).await?;

        info!(elapsed_ms = started.elapsed().as_millis() as u64, "refresh cycle complete");
        Ok(())
    }

    /// Capture the rendered view, pack it, and push it to the glass. A
    /// failure here aborts the cycle; the panel is parked in sleep.
    async fn capture_and_display(&mut self, cycle: &ShutdownHandle) -> ServerResult<()> {
        let result = self.capture_and_display_inner(cycle).await;
        if let Err(ref e) = result {
            if !e.is_cancelled() {
                error!(error = %e, "capture/display pipeline failed");
            }
            self.sleep_panel().await;
        }
        result
    }

    async fn capture_and_display_inner(&mut self, cycle: &ShutdownHandle) -> ServerResult<()> {
        let preview = preview_path(self.options.debug);
        if let Some(parent) = preview.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut opts = CaptureOptions::new(
            format!("http://{}/calendar", self.config.listen),
            &preview,
        );
        if self.config.basic_auth_enabled() {
            let auth = self.config.basic_auth.as_ref().expect("checked enabled");
            opts.basic_auth = Some((auth.username.clone(), auth.password.clone()));
        }

        let raster = capture_png(opts, cycle).await?;

        let rotation = self.config.rotation;
        let planes = tokio::task::spawn_blocking(move || pack_planes(&raster, rotation))
            .await
            .map_err(|e| ServerError::capture(format!("pack task failed: {e}")))??;

        if self.options.dump {
            let dir = preview.parent().unwrap_or_else(|| std::path::Path::new("."));
            tokio::fs::write(dir.join("black.bin"), &planes.black).await?;
            tokio::fs::write(dir.join("red.bin"), &planes.red).await?;
            info!(dir = %dir.display(), "dumped plane buffers");
        }

        if self.options.render_only || self.panel.is_none() {
            return Ok(());
        }

        let mut panel = self.panel.take().expect("checked above");
        let cancel = cycle.cancel_fn();
        let (panel, displayed) = tokio::task::spawn_blocking(move || {
            let result = (|| {
                // A fresh handle or a panel parked after an abort needs a
                // bring-up before it accepts a frame.
                if panel.state() != PanelState::Ready {
                    panel.init()?;
                }
                panel.display(&planes, &cancel)
            })();
            (panel, result)
        })
        .await
        .map_err(|e| ServerError::capture(format!("display task failed: {e}")))?;
        self.panel = Some(panel);
        displayed?;

        info!("panel frame updated");
        Ok(())
    }

    /// Best-effort transition to deep sleep; keeps the handle for later
    /// re-init.
    pub async fn sleep_panel(&mut self) {
        let Some(mut panel) = self.panel.take() else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || {
            let result = match panel.state() {
                PanelState::Ready => panel.sleep(),
                _ => Ok(()),
            };
            (panel, result)
        })
        .await;

        match result {
            Ok((panel, Ok(()))) => self.panel = Some(panel),
            Ok((panel, Err(e))) => {
                warn!(error = %e, "panel sleep failed");
                self.panel = Some(panel);
            }
            Err(e) => warn!(error = %e, "panel sleep task failed"),
        }
    }
}

/// Parses a cron expression, accepting the standard 5-field crontab form
/// by prepending a seconds field.
pub fn parse_schedule(expr: &str) -> ServerResult<Schedule> {
    let normalized = normalize_cron(expr);
    Schedule::from_str(&normalized).map_err(|e| ServerError::schedule(expr, e.to_string()))
}

fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Fire times in `(fire_at, now]` beyond the tick just handled.
fn missed_ticks(
    schedule: &Schedule,
    fire_at: &chrono::DateTime<Tz>,
    now: &chrono::DateTime<Tz>,
) -> usize {
    schedule
        .after(fire_at)
        .take_while(|t| t <= now)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_cron_gets_seconds() {
        assert_eq!(normalize_cron("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize_cron("0 */15 * * * *"), "0 */15 * * * *");
    }

    #[test]
    fn default_refresh_schedule_parses() {
        let schedule = parse_schedule("*/15 * * * *").unwrap();
        let tz: Tz = "Asia/Seoul".parse().unwrap();
        let now = tz.with_ymd_and_hms(2025, 1, 10, 12, 1, 0).unwrap();
        let next = schedule.after(&now).next().unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2025, 1, 10, 12, 15, 0).unwrap());
    }

    #[test]
    fn garbage_schedule_is_rejected() {
        assert!(matches!(
            parse_schedule("every full moon"),
            Err(ServerError::Schedule { .. })
        ));
    }

    #[test]
    fn missed_ticks_counts_overrun() {
        let schedule = parse_schedule("*/15 * * * *").unwrap();
        let tz: Tz = "Asia/Seoul".parse().unwrap();
        let fire_at = tz.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap();

        // Cycle finished 40 minutes later: the 12:15 and 12:30 ticks are
        // dropped, 12:45 is still ahead.
        let now = tz.with_ymd_and_hms(2025, 1, 10, 12, 40, 0).unwrap();
        assert_eq!(missed_ticks(&schedule, &fire_at, &now), 2);

        // Fast cycle: nothing missed.
        let quick = tz.with_ymd_and_hms(2025, 1, 10, 12, 0, 30).unwrap();
        assert_eq!(missed_ticks(&schedule, &fire_at, &quick), 0);
    }

    #[tokio::test]
    async fn cycle_with_no_sources_and_no_panel_still_needs_capture() {
        // Without a renderer listening, the capture step must fail the
        // cycle, never hang: the deadline and error path are the contract.
        let config = Config {
            listen: "127.0.0.1:1".to_string(), // nothing listens here
            ..Config::default()
        };
        let options = CycleOptions {
            debug: true,
            render_only: true,
            ..CycleOptions::default()
        };
        let shutdown = ShutdownHandle::new();
        // Capture requires a browser binary; only exercise the wiring when
        // one is present.
        if std::env::var_os("EPDCAL_TEST_CHROMIUM").is_none() {
            return;
        }
        let mut orch = Orchestrator::new(config, options, None, shutdown).unwrap();
        let result = orch.run_cycle().await;
        assert!(result.is_err());
    }
}
