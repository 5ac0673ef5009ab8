use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[derive(Clone, Default)]
pub struct FilterMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // TCP forwarder
    tcp_allowed_total: AtomicU64,
    tcp_denied_total: AtomicU64,
    tcp_conns_active: AtomicU64,
    tcp_dial_fail_total: AtomicU64,

    // UDP forwarder
    udp_allowed_total: AtomicU64,
    udp_denied_total: AtomicU64,
    udp_flows_active: AtomicU64,

    endpoint_fail_total: AtomicU64,

    // DNS tracking
    dns_responses_learned_total: AtomicU64,
    direct_ip_blocked_total: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tcp_allowed_total: u64,
    pub tcp_denied_total: u64,
    pub tcp_conns_active: u64,
    pub tcp_dial_fail_total: u64,
    pub udp_allowed_total: u64,
    pub udp_denied_total: u64,
    pub udp_flows_active: u64,
    pub endpoint_fail_total: u64,
    pub dns_responses_learned_total: u64,
    pub direct_ip_blocked_total: u64,
}

impl FilterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tcp_allowed(&self) {
        self.inner.tcp_allowed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_denied(&self) {
        self.inner.tcp_denied_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_conn_opened(&self) {
        self.inner.tcp_conns_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_conn_closed(&self) {
        self.inner.tcp_conns_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn tcp_dial_failed(&self) {
        self.inner
            .tcp_dial_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_allowed(&self) {
        self.inner.udp_allowed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_denied(&self) {
        self.inner.udp_denied_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_flow_opened(&self) {
        self.inner.udp_flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_flow_closed(&self) {
        self.inner.udp_flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn endpoint_failed(&self) {
        self.inner
            .endpoint_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn dns_response_learned(&self) {
        self.inner
            .dns_responses_learned_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn direct_ip_blocked(&self) {
        self.inner
            .direct_ip_blocked_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            tcp_allowed_total: inner.tcp_allowed_total.load(Ordering::Relaxed),
            tcp_denied_total: inner.tcp_denied_total.load(Ordering::Relaxed),
            tcp_conns_active: inner.tcp_conns_active.load(Ordering::Relaxed),
            tcp_dial_fail_total: inner.tcp_dial_fail_total.load(Ordering::Relaxed),
            udp_allowed_total: inner.udp_allowed_total.load(Ordering::Relaxed),
            udp_denied_total: inner.udp_denied_total.load(Ordering::Relaxed),
            udp_flows_active: inner.udp_flows_active.load(Ordering::Relaxed),
            endpoint_fail_total: inner.endpoint_fail_total.load(Ordering::Relaxed),
            dns_responses_learned_total: inner.dns_responses_learned_total.load(Ordering::Relaxed),
            direct_ip_blocked_total: inner.direct_ip_blocked_total.load(Ordering::Relaxed),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();

        push_counter(&mut out, "egress_tcp_allowed_total", snap.tcp_allowed_total);
        push_counter(&mut out, "egress_tcp_denied_total", snap.tcp_denied_total);
        push_gauge(&mut out, "egress_tcp_conns_active", snap.tcp_conns_active);
        push_counter(
            &mut out,
            "egress_tcp_dial_fail_total",
            snap.tcp_dial_fail_total,
        );

        push_counter(&mut out, "egress_udp_allowed_total", snap.udp_allowed_total);
        push_counter(&mut out, "egress_udp_denied_total", snap.udp_denied_total);
        push_gauge(&mut out, "egress_udp_flows_active", snap.udp_flows_active);

        push_counter(
            &mut out,
            "egress_endpoint_fail_total",
            snap.endpoint_fail_total,
        );

        push_counter(
            &mut out,
            "egress_dns_responses_learned_total",
            snap.dns_responses_learned_total,
        );
        push_counter(
            &mut out,
            "egress_direct_ip_blocked_total",
            snap.direct_ip_blocked_total,
        );

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "gauge", val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "counter", val);
}

fn push_metric(out: &mut String, name: &str, kind: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(kind);
    out.push('\n');
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}
