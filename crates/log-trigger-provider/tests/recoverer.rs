mod common;

use std::{sync::Arc, time::Duration};

use alloy_primitives::B256;
use common::{DataPacker, MockChainClient, MockLogPoller, address, log, trigger_config};
use log_trigger_provider::{
    CoordinatedProposal, Error, FilterStore, InMemoryUpkeepStateStore, Log, LogRecoverer,
    RecovererOptions, Trigger, UpkeepFilter, UpkeepId, UpkeepPayload, UpkeepState, UpkeepType,
    WorkId,
    recoverer::{DEFAULT_BLOCK_TIME, RECOVERY_CACHE_TTL},
};

type Recoverer = LogRecoverer<MockLogPoller, MockChainClient, InMemoryUpkeepStateStore, DataPacker>;

/// With the default block time of one second a day is 86400 blocks, so the
/// recovery window at this height is `[13600, 99800]`.
const LATEST: u64 = 100_000;

struct Harness {
    poller: Arc<MockLogPoller>,
    client: Arc<MockChainClient>,
    states: Arc<InMemoryUpkeepStateStore>,
    store: Arc<FilterStore>,
    recoverer: Recoverer,
}

fn options() -> RecovererOptions {
    RecovererOptions {
        interval: Duration::from_secs(5),
        lookback_blocks: 200,
        finality_depth: 0,
        max_proposals: 20,
        allowed_logs_per_upkeep: 5,
    }
}

fn setup(latest: u64) -> Harness {
    let poller = Arc::new(MockLogPoller::new(latest));
    let client = Arc::new(MockChainClient::default());
    let states = Arc::new(InMemoryUpkeepStateStore::new());
    let store = Arc::new(FilterStore::new());
    let recoverer = LogRecoverer::new(
        options(),
        poller.clone(),
        client.clone(),
        states.clone(),
        Arc::new(DataPacker),
        store.clone(),
    );
    Harness {
        poller,
        client,
        states,
        store,
        recoverer,
    }
}

fn upkeep(seed: u8) -> UpkeepId {
    UpkeepId::generate(UpkeepType::LogTrigger, [seed])
}

impl Harness {
    fn add_filter(&self, seed: u8, config_update_block: u64) -> UpkeepId {
        let id = upkeep(seed);
        self.store.add_active_upkeeps([UpkeepFilter::new(
            id,
            &trigger_config(seed, 1),
            config_update_block,
        )]);
        id
    }

    fn set_last_re_poll(&self, id: UpkeepId, block: u64) {
        let Some(filter) = self.store.get(&id) else {
            return;
        };
        self.store.update_filters(
            |current, _| {
                let mut f = current.clone();
                f.last_re_poll_block = block;
                f
            },
            &[filter],
        );
    }

    /// Put logs on chain with their receipts.
    fn add_chain_logs(&self, logs: &[Log]) {
        for log in logs {
            self.client.add_log_receipt(log);
        }
        self.poller.add_logs(logs.iter().cloned());
    }
}

/// Payload as the recoverer builds it: check block zeroed.
fn recovered_payload(id: UpkeepId, log: &Log) -> UpkeepPayload {
    let mut trigger = Trigger::from_log(log);
    trigger.block_number = 0;
    trigger.block_hash = B256::ZERO;
    UpkeepPayload::new(id, trigger, log.data.clone())
}

#[tokio::test]
async fn recovers_logs_outside_lookback() {
    let h = setup(LATEST);
    let id = h.add_filter(1, 0);
    let logs = [log(13_700, 0, 1, 1), log(13_750, 2, 1, 1)];
    h.add_chain_logs(&logs);

    assert_eq!(h.recoverer.get_recovery_window(LATEST), (13_600, 99_800));
    h.recoverer.recover().await.unwrap();

    // far behind: burst range
    assert_eq!(h.poller.read_queries(), vec![(13_600, 14_100, address(1))]);
    assert_eq!(h.store.get(&id).unwrap().last_re_poll_block, 14_100);
    assert_eq!(h.recoverer.pending_len(), 2);

    let proposals = h.recoverer.get_recovery_proposals().await.unwrap();
    assert_eq!(proposals.len(), 2);
    assert!(proposals.iter().all(|p| p.trigger.block_number == 0));
    assert!(proposals.iter().all(|p| p.trigger.block_hash == B256::ZERO));
    assert_eq!(h.recoverer.pending_len(), 0);

    for proposal in &proposals {
        let data = h
            .recoverer
            .get_proposal_data(&CoordinatedProposal::from(proposal))
            .await
            .unwrap();
        let original = logs
            .iter()
            .find(|l| l.tx_hash == proposal.trigger.log_trigger_extension.unwrap().tx_hash)
            .unwrap();
        assert_eq!(data, original.data);
    }
}

#[tokio::test]
async fn resolved_logs_are_not_recovered() {
    let h = setup(LATEST);
    let id = h.add_filter(1, 0);
    let performed = log(13_700, 0, 1, 1);
    let ineligible = log(13_710, 0, 1, 1);
    h.add_chain_logs(&[performed.clone(), ineligible.clone(), log(13_720, 0, 1, 1)]);

    h.states
        .set_state(WorkId::new(&id, &Trigger::from_log(&performed)), UpkeepState::Performed);
    h.states.set_state(
        WorkId::new(&id, &Trigger::from_log(&ineligible)),
        UpkeepState::Ineligible,
    );

    h.recoverer.recover().await.unwrap();
    assert_eq!(h.recoverer.pending_len(), 1);
}

#[tokio::test]
async fn scan_range_follows_filter_cursor() {
    let h = setup(LATEST);
    let regular = h.add_filter(1, 0);
    h.set_last_re_poll(regular, 90_000);
    h.add_filter(2, 95_000);
    let near_end = h.add_filter(3, 0);
    h.set_last_re_poll(near_end, 99_700);
    let done = h.add_filter(4, 0);
    h.set_last_re_poll(done, 99_800);
    // not active before the end of the window
    h.add_filter(5, 99_900);

    h.recoverer.recover().await.unwrap();

    let mut queries = h.poller.read_queries();
    queries.sort();
    assert_eq!(
        queries,
        vec![
            (90_001, 90_201, address(1)),
            (95_000, 95_200, address(2)),
            (99_701, 99_800, address(3)),
        ]
    );
    assert_eq!(h.store.get(&near_end).unwrap().last_re_poll_block, 99_800);
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let h = setup(LATEST);
    let id = h.add_filter(1, 0);

    // another scan advances the cursor while this one reads
    let store = h.store.clone();
    h.poller.on_read(move || {
        if let Some(filter) = store.get(&id) {
            store.update_filters(
                |current, _| {
                    let mut f = current.clone();
                    f.last_re_poll_block = 50_000;
                    f
                },
                &[filter],
            );
        }
    });

    h.recoverer.recover().await.unwrap();
    assert_eq!(h.poller.read_queries(), vec![(13_600, 14_100, address(1))]);
    assert_eq!(h.store.get(&id).unwrap().last_re_poll_block, 50_000);
}

#[tokio::test]
async fn young_chain_has_nothing_to_recover() {
    let h = setup(150);
    h.add_filter(1, 0);

    h.recoverer.recover().await.unwrap();
    assert!(h.poller.read_queries().is_empty());
}

#[tokio::test]
async fn recover_needs_head() {
    let h = setup(LATEST);
    h.poller.clear_latest();

    assert!(matches!(
        h.recoverer.recover().await,
        Err(Error::HeadNotAvailable(_))
    ));
    assert!(matches!(
        h.recoverer.get_recovery_proposals().await,
        Err(Error::HeadNotAvailable(_))
    ));
}

#[tokio::test]
async fn visited_logs_are_not_queued_twice() {
    let h = setup(LATEST);
    let id = h.add_filter(1, 0);
    h.add_chain_logs(&[log(13_700, 0, 1, 1), log(13_750, 0, 1, 1)]);

    h.recoverer.recover().await.unwrap();
    h.set_last_re_poll(id, 0);
    h.recoverer.recover().await.unwrap();

    assert_eq!(h.recoverer.pending_len(), 2);
    assert_eq!(h.recoverer.visited_len(), 2);
}

#[tokio::test]
async fn full_pending_queue_holds_the_cursor() {
    let h = setup(LATEST);
    let id = h.add_filter(1, 0);
    let logs: Vec<_> = (0..=500).map(|i| log(13_700, i, 1, 1)).collect();
    h.add_chain_logs(&logs);

    h.recoverer.recover().await.unwrap();

    assert_eq!(h.recoverer.pending_len(), 500);
    assert_eq!(h.store.get(&id).unwrap().last_re_poll_block, 0);
}

#[tokio::test]
async fn proposals_are_capped() {
    let h = setup(LATEST);
    for seed in 1..=5 {
        h.add_filter(seed, 0);
        h.add_chain_logs(&(0..8).map(|i| log(13_700, i, seed, 1)).collect::<Vec<_>>());
    }
    h.recoverer.recover().await.unwrap();
    assert_eq!(h.recoverer.pending_len(), 40);

    let proposals = h.recoverer.get_recovery_proposals().await.unwrap();
    assert_eq!(proposals.len(), 20);
    for seed in 1..=5 {
        let per_upkeep = proposals.iter().filter(|p| p.upkeep_id == upkeep(seed)).count();
        assert!(per_upkeep <= 5);
    }
    assert_eq!(h.recoverer.pending_len(), 20);

    let next = h.recoverer.get_recovery_proposals().await.unwrap();
    assert!(!next.is_empty());
    assert!(next.iter().all(|p| !proposals.contains(p)));
    assert_eq!(h.recoverer.pending_len(), 20 - next.len());
}

#[tokio::test]
async fn single_upkeep_gets_allowed_logs_only() {
    let h = setup(LATEST);
    h.add_filter(1, 0);
    h.add_chain_logs(&(0..8).map(|i| log(13_700, i, 1, 1)).collect::<Vec<_>>());
    h.recoverer.recover().await.unwrap();

    assert_eq!(h.recoverer.get_recovery_proposals().await.unwrap().len(), 5);
    assert_eq!(h.recoverer.pending_len(), 3);
}

#[tokio::test]
async fn proposal_order_is_shared_between_nodes() {
    let mut orders = Vec::new();
    for _ in 0..2 {
        let h = setup(LATEST);
        for seed in 1..=3 {
            h.add_filter(seed, 0);
            h.add_chain_logs(&(0..4).map(|i| log(13_700, i, seed, 1)).collect::<Vec<_>>());
        }
        h.recoverer.recover().await.unwrap();
        let proposals = h.recoverer.get_recovery_proposals().await.unwrap();
        orders.push(proposals.iter().map(|p| p.work_id).collect::<Vec<_>>());
    }
    assert_eq!(orders[0].len(), 12);
    assert_eq!(orders[0], orders[1]);
}

#[tokio::test]
async fn proposal_data_validation() {
    let h = setup(LATEST);
    let id = h.add_filter(1, 0);
    let on_chain = log(13_700, 0, 1, 1);
    h.add_chain_logs(std::slice::from_ref(&on_chain));

    let proposal = |log: &Log| CoordinatedProposal::from(&recovered_payload(id, log));
    let message = |result: Result<_, Error>| result.unwrap_err().to_string();

    assert_eq!(
        h.recoverer.get_proposal_data(&proposal(&on_chain)).await.unwrap(),
        on_chain.data
    );

    let conditional = UpkeepId::generate(UpkeepType::Conditional, [1]);
    let mut p = proposal(&on_chain);
    p.upkeep_id = conditional;
    assert_eq!(
        message(h.recoverer.get_proposal_data(&p).await),
        "not a log trigger upkeep ID"
    );

    let unknown = upkeep(9);
    let mut p = proposal(&on_chain);
    p.upkeep_id = unknown;
    assert_eq!(
        message(h.recoverer.get_proposal_data(&p).await),
        format!("filter not found for upkeep {unknown}")
    );

    let mut p = proposal(&on_chain);
    p.trigger.log_trigger_extension = None;
    assert_eq!(
        message(h.recoverer.get_proposal_data(&p).await),
        "missing log trigger extension"
    );

    let unmined = log(13_800, 0, 1, 1);
    assert_eq!(
        message(h.recoverer.get_proposal_data(&proposal(&unmined)).await),
        "failed to get tx block"
    );

    let reorged = log(13_900, 0, 1, 1);
    h.client
        .set_receipt(reorged.tx_hash, reorged.block_number, B256::repeat_byte(0xee));
    assert_eq!(
        message(h.recoverer.get_proposal_data(&proposal(&reorged)).await),
        "log tx reorged"
    );

    let recent = log(99_900, 0, 1, 1);
    h.add_chain_logs(std::slice::from_ref(&recent));
    assert_eq!(
        message(h.recoverer.get_proposal_data(&proposal(&recent)).await),
        "log block is not recoverable"
    );

    let performed = log(14_000, 0, 1, 1);
    h.add_chain_logs(std::slice::from_ref(&performed));
    h.states.set_state(proposal(&performed).work_id, UpkeepState::Performed);
    assert_eq!(
        message(h.recoverer.get_proposal_data(&proposal(&performed)).await),
        "upkeep state is not recoverable"
    );

    // mined but not emitted by the filtered contract
    let foreign = log(14_100, 0, 2, 1);
    h.add_chain_logs(std::slice::from_ref(&foreign));
    let p = proposal(&foreign);
    assert_eq!(
        message(h.recoverer.get_proposal_data(&p).await),
        format!("no log found for upkeepID {id} and trigger {}", p.trigger)
    );

    h.store.add_active_upkeeps([UpkeepFilter::new(id, &trigger_config(1, 1), 20_000)]);
    assert!(
        message(h.recoverer.get_proposal_data(&proposal(&on_chain)).await)
            .contains("is before the filter configUpdateBlock")
    );

    h.poller.fail_logs(true);
    h.store.add_active_upkeeps([UpkeepFilter::new(id, &trigger_config(1, 1), 0)]);
    assert!(
        message(h.recoverer.get_proposal_data(&proposal(&on_chain)).await)
            .starts_with("could not read logs")
    );
}

#[tokio::test(start_paused = true)]
async fn clean_requeues_or_expires_visited_entries() {
    let h = setup(LATEST);
    let id = h.add_filter(1, 0);
    let performed = log(13_700, 0, 1, 1);
    let unresolved = log(13_750, 0, 1, 1);
    h.add_chain_logs(&[performed.clone(), unresolved.clone()]);

    h.recoverer.recover().await.unwrap();
    assert_eq!(h.recoverer.get_recovery_proposals().await.unwrap().len(), 2);
    assert_eq!(h.recoverer.visited_len(), 2);

    // nothing expired yet
    h.recoverer.clean().await;
    assert_eq!(h.recoverer.visited_len(), 2);
    assert_eq!(h.recoverer.pending_len(), 0);

    tokio::time::advance(RECOVERY_CACHE_TTL + Duration::from_secs(1)).await;
    h.states.set_state(
        recovered_payload(id, &performed).work_id,
        UpkeepState::Performed,
    );
    h.recoverer.clean().await;

    assert_eq!(h.recoverer.visited_len(), 1);
    assert_eq!(h.recoverer.pending_len(), 1);
    assert!(h.recoverer.is_pending(&recovered_payload(id, &unresolved).work_id));

    // the log falls out of the recovery window
    h.poller.set_latest(200_000);
    tokio::time::advance(RECOVERY_CACHE_TTL + Duration::from_secs(1)).await;
    h.recoverer.clean().await;

    assert_eq!(h.recoverer.visited_len(), 0);
    assert_eq!(h.recoverer.pending_len(), 0);
}

#[tokio::test]
async fn block_time_is_measured_from_recent_blocks() {
    let h = setup(LATEST);
    assert_eq!(h.recoverer.block_time(), DEFAULT_BLOCK_TIME);

    h.recoverer.update_block_time().await;
    assert_eq!(h.recoverer.block_time(), Duration::from_secs(common::BLOCK_TIME_SECS));
    // 7200 blocks a day
    assert_eq!(h.recoverer.get_recovery_window(LATEST), (92_800, 99_800));

    let young = setup(5_000);
    young.recoverer.update_block_time().await;
    assert_eq!(young.recoverer.block_time(), DEFAULT_BLOCK_TIME);
}

#[tokio::test(start_paused = true)]
async fn start_and_close() {
    let h = setup(LATEST);
    h.add_filter(1, 0);
    h.add_chain_logs(&[log(93_000, 0, 1, 1)]);

    h.recoverer.start().unwrap();
    h.recoverer.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.recoverer.block_time(), Duration::from_secs(common::BLOCK_TIME_SECS));
    h.recoverer.close().await;
}
