use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

// Create a new registry named `peg`
lazy_static! {
    pub static ref PEG_REGISTRY: Registry =
        Registry::new_custom(Some("peg".to_string()), None).unwrap();
}

// Register metrics with the `peg` registry
lazy_static! {
    pub static ref PEGIN_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "pegin_totals",
        "Peg-in transactions processed, labeled by outcome",
        &["outcome"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref PEGIN_REGISTERED_SATS: IntCounter = register_int_counter_with_registry!(
        "pegin_registered_sats_total",
        "Total value of registered peg-ins in satoshis",
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref RELEASE_REQUEST_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "release_request_totals",
        "Release requests received, labeled by outcome",
        &["outcome"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref RELEASE_TRANSACTIONS_BUILT: IntCounterVec =
        register_int_counter_vec_with_registry!(
            "release_transactions_built_total",
            "Release transactions built, labeled by kind",
            &["kind"],
            PEG_REGISTRY
        )
        .unwrap();
    pub static ref RELEASE_BUILD_FAILURES: IntCounterVec = register_int_counter_vec_with_registry!(
        "release_build_failures_total",
        "Release transactions that could not be built, labeled by kind and response",
        &["kind", "response"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref SIGNATURE_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "signature_totals",
        "Federator signature submissions, labeled by outcome",
        &["outcome"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref FEDERATION_CHANGE_VOTES: IntCounterVec = register_int_counter_vec_with_registry!(
        "federation_change_votes_total",
        "Federation change votes, labeled by function and result",
        &["function", "result"],
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref RELEASE_QUEUE_LENGTH: IntGauge = register_int_gauge_with_registry!(
        "release_queue_length",
        "Release requests waiting to be built",
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref PEGOUTS_WAITING_FOR_CONFIRMATIONS: IntGauge = register_int_gauge_with_registry!(
        "pegouts_waiting_for_confirmations",
        "Built release transactions waiting for confirmations",
        PEG_REGISTRY
    )
    .unwrap();
    pub static ref PEGOUTS_WAITING_FOR_SIGNATURES: IntGauge = register_int_gauge_with_registry!(
        "pegouts_waiting_for_signatures",
        "Release transactions collecting federator signatures",
        PEG_REGISTRY
    )
    .unwrap();
}
