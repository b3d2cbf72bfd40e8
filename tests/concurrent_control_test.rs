// ==========================================
// 并发控制测试
// ==========================================
// 测试范围:
// 1. 同一物料并发预留: 欠账总量精确、不变式成立
// 2. 两个批次并发抢同一产线: 只有一个 LOCKED
// 3. 同一工单并发报工: 只有一次生效，物料只消耗一次
// 4. 多线程运行时下入库/领用交错: 账面守恒
// 5. 并发分解批次: 入口预留总量与欠账一致
// ==========================================

#[path = "test_helpers.rs"]
mod test_helpers;

#[cfg(test)]
mod concurrent_control_test {
    use super::test_helpers::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use softtoy_production::app::AppState;
    use softtoy_production::{ApiError, Department, LineState, Qty, TransferState};

    fn setup_shared() -> (tempfile::NamedTempFile, Arc<AppState>) {
        let (temp_file, state) = create_test_state();
        seed_bear(&state);
        (temp_file, Arc::new(state))
    }

    /// reserved ≤ on_hand + 未偿欠账
    fn assert_covered(state: &AppState, material_id: &str) {
        let pos = state
            .warehouse_api
            .get_stock_position(material_id, LOCATION)
            .unwrap();
        let debt = state.warehouse_api.outstanding_debt(material_id).unwrap();
        assert!(
            pos.reserved <= pos.on_hand + debt,
            "{}: 预留 {} > 账面 {} + 欠账 {}",
            material_id,
            pos.reserved,
            pos.on_hand,
            debt
        );
    }

    // ==========================================
    // 测试1: 并发预留
    // ==========================================
    #[test]
    fn test_concurrent_reserve_same_material() {
        let (_tmp, state) = setup_shared();
        state
            .warehouse_api
            .receive("PLUSH", LOCATION, q("300"), OPERATOR)
            .unwrap();

        let threads = 8;
        let per_thread = 10;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut debts = 0;
                    for _ in 0..per_thread {
                        let out = state
                            .warehouse_api
                            .reserve("PLUSH", LOCATION, q("7"), &format!("worker-{}", i))
                            .unwrap();
                        if out.debt_created {
                            debts += 1;
                        }
                    }
                    debts
                })
            })
            .collect();
        let debts_created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let pos = state.warehouse_api.get_stock_position("PLUSH", LOCATION).unwrap();
        assert_eq!(pos.reserved, q("560"));
        assert_eq!(pos.on_hand, q("300"));
        assert_eq!(state.warehouse_api.outstanding_debt("PLUSH").unwrap(), q("260"));
        assert_eq!(
            state.warehouse_api.list_debts(Some("PLUSH"), true).unwrap().len(),
            debts_created
        );
        assert_covered(&state, "PLUSH");
        assert_eq!(
            state.action_log_repo.count_by_action_type("Reserve").unwrap(),
            (threads * per_thread) as i32
        );
    }

    // ==========================================
    // 测试2: 并发抢占产线
    // ==========================================
    #[test]
    fn test_concurrent_initiate_single_line_owner() {
        let (_tmp, state) = setup_shared();
        state
            .warehouse_api
            .receive("PLUSH", LOCATION, q("1000"), OPERATOR)
            .unwrap();

        let runs: Vec<_> = (0..4)
            .map(|_| {
                let out = generate(&state, "100");
                run_to_target(&state, &out.tasks[0].task_id);
                (out.tasks[0].task_id.clone(), out.run.batch_id.clone())
            })
            .collect();

        let barrier = Arc::new(Barrier::new(runs.len()));
        let handles: Vec<_> = runs
            .into_iter()
            .map(|(task_id, batch_id)| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    state
                        .handshake_api
                        .initiate_transfer(&task_id, Department::Embroidery, q("110"), &batch_id, OPERATOR)
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<_> = outcomes.iter().filter(|o| !o.blocked).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.blocked).count(), 3);

        let line = state
            .handshake_api
            .get_line_status(Department::Embroidery)
            .unwrap();
        assert_eq!(line.state, LineState::Occupied);
        assert_eq!(line.batch_id.as_deref(), Some(winners[0].transfer.batch_id.as_str()));
        assert_eq!(
            state
                .handshake_api
                .list_transfers(Some(Department::Embroidery), Some(TransferState::Locked))
                .unwrap()
                .len(),
            1
        );
    }

    // ==========================================
    // 测试3: 同一工单并发报工
    // ==========================================
    #[test]
    fn test_concurrent_report_same_task() {
        let (_tmp, state) = setup_shared();
        state
            .warehouse_api
            .receive("PLUSH", LOCATION, q("1000"), OPERATOR)
            .unwrap();
        let out = generate(&state, "100");
        let task_id = out.tasks[0].task_id.clone();
        state.production_api.start_task(&task_id, OPERATOR).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                let task_id = task_id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    state
                        .production_api
                        .record_task_output(&task_id, q("110"), Qty::ZERO, OPERATOR)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ApiError::InvalidStateTransition { .. })));

        let task = state.production_api.get_task(&task_id).unwrap();
        assert_eq!(task.actual_output_qty, q("110"));
        let pos = state.warehouse_api.get_stock_position("PLUSH", LOCATION).unwrap();
        assert_eq!(pos.consumed, q("57.75"));
        assert_eq!(pos.reserved, Qty::ZERO);
    }

    // ==========================================
    // 测试4: 入库/领用交错（tokio 多线程运行时）
    // ==========================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_receive_and_consume() {
        let (_tmp, state) = setup_shared();

        let mut handles = Vec::new();
        for i in 0..20 {
            let receiver = Arc::clone(&state);
            handles.push(tokio::task::spawn_blocking(move || {
                receiver
                    .warehouse_api
                    .receive("FIBER", LOCATION, q("10"), &format!("wh-{}", i))
                    .map(|_| ())
            }));
            let consumer = Arc::clone(&state);
            handles.push(tokio::task::spawn_blocking(move || {
                consumer
                    .warehouse_api
                    .consume("FIBER", LOCATION, q("7"), &format!("line-{}", i))
                    .map(|_| ())
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let pos = state.warehouse_api.get_stock_position("FIBER", LOCATION).unwrap();
        assert_eq!(pos.on_hand, q("60"));
        assert_eq!(pos.consumed, q("140"));
        assert_eq!(pos.reserved, Qty::ZERO);
        assert_covered(&state, "FIBER");
        assert_eq!(state.action_log_repo.count_by_action_type("Receive").unwrap(), 20);
        assert_eq!(state.action_log_repo.count_by_action_type("Consume").unwrap(), 20);
    }

    // ==========================================
    // 测试5: 并发分解批次
    // ==========================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_generate_runs() {
        let (_tmp, state) = setup_shared();
        state
            .warehouse_api
            .receive("PLUSH", LOCATION, q("100"), OPERATOR)
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let state = Arc::clone(&state);
            handles.push(tokio::task::spawn_blocking(move || generate(&state, "100")));
        }
        let mut batches = Vec::new();
        for h in handles {
            batches.push(h.await.unwrap().run.batch_id);
        }
        batches.sort();
        batches.dedup();
        assert_eq!(batches.len(), 5);

        let pos = state.warehouse_api.get_stock_position("PLUSH", LOCATION).unwrap();
        assert_eq!(pos.reserved, q("288.75"));
        assert_eq!(state.warehouse_api.outstanding_debt("PLUSH").unwrap(), q("188.75"));
        assert_covered(&state, "PLUSH");
    }
}
