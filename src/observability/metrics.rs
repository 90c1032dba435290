use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_sent_total: IntCounter,
    pub assignments_total: IntCounterVec,
    pub location_updates_total: IntCounterVec,
    pub bus_messages_total: IntCounterVec,
    pub hub_connections: IntGauge,
    pub hub_dropped_connections_total: IntCounter,
    pub dispatch_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_sent_total = IntCounter::new("offers_sent_total", "Ride offers pushed to drivers")
            .expect("valid offers_sent_total metric");

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Driver responses by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let location_updates_total = IntCounterVec::new(
            Opts::new("location_updates_total", "Driver location updates by outcome"),
            &["outcome"],
        )
        .expect("valid location_updates_total metric");

        let bus_messages_total = IntCounterVec::new(
            Opts::new("bus_messages_total", "Consumed bus messages by queue and disposition"),
            &["queue", "disposition"],
        )
        .expect("valid bus_messages_total metric");

        let hub_connections = IntGauge::new("hub_connections", "Live connections registered in the hub")
            .expect("valid hub_connections metric");

        let hub_dropped_connections_total = IntCounter::new(
            "hub_dropped_connections_total",
            "Connections dropped because their outbound queue was full or closed",
        )
        .expect("valid hub_dropped_connections_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of handling one ride request in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        registry
            .register(Box::new(offers_sent_total.clone()))
            .expect("register offers_sent_total");
        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(location_updates_total.clone()))
            .expect("register location_updates_total");
        registry
            .register(Box::new(bus_messages_total.clone()))
            .expect("register bus_messages_total");
        registry
            .register(Box::new(hub_connections.clone()))
            .expect("register hub_connections");
        registry
            .register(Box::new(hub_dropped_connections_total.clone()))
            .expect("register hub_dropped_connections_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");

        Self {
            registry,
            offers_sent_total,
            assignments_total,
            location_updates_total,
            bus_messages_total,
            hub_connections,
            hub_dropped_connections_total,
            dispatch_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
