//! Statsd metrics.
//!
//! Metrics are emitted through the [`metric!`](crate::metric) macro and reported once
//! [`configure_statsd`] has been called. Until then, and in tests, every metric is a no-op.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{MetricError, StatsdClient, UdpMetricSink};

static STATSD_CLIENT: OnceLock<StatsdClient> = OnceLock::new();

/// The traits needed to emit metrics with the client passed to [`with_client`].
pub mod prelude {
    pub use cadence::prelude::*;
}

fn log_metric_error(error: MetricError) {
    tracing::debug!(error = &error as &dyn std::error::Error, "Failed to send metric");
}

/// Tell the metrics system to report to statsd.
///
/// Every metric is prefixed with `prefix` and carries the given `tags`. Fails if `host` does not
/// resolve, or if statsd has been configured before.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host resolved to no address");
    };
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket)?;

    let mut builder = StatsdClient::builder(prefix, sink).with_error_handler(log_metric_error);
    for (key, value) in tags {
        builder = builder.with_tag(key, value);
    }

    STATSD_CLIENT
        .set(builder.build())
        .map_err(|_| anyhow::anyhow!("statsd is already configured"))
}

/// Invokes `f` with the statsd client, if one is configured.
#[inline(always)]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&StatsdClient),
{
    if let Some(client) = STATSD_CLIENT.get() {
        f(client)
    }
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("pipeline.load") += 1, "status" => "cached");
/// metric!(gauge("pipeline.in_flight") = 4);
/// metric!(timer("futures.done") = elapsed);
/// metric!(time_raw("service.download.size") = 1024);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    // sizes are reported as timers as well, in raw units instead of durations
    (time_raw($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.$method($id, $value)
                $(.with_tag($k, $v))*
                .send();
        })
    }};
}
