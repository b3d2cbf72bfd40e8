// ==========================================
// 全流程端到端测试
// ==========================================
// 测试范围:
// 场景A: on_hand=60 预留 100 → 成功且欠账 40
// 场景B: 入库 50 偿还 40 欠账 → SETTLED，10 计入可用库存
// 场景C: 500 件、缓冲 1.10/1.05/1.00 → 目标 550/577/577
// 场景D: 产线被 B1 占用时 B2 交接 → BLOCKED，产线不变
// 场景E: 发出 100 实收 80（差异 20%）→ 拒收，保持 LOCKED
// 全链路: 五道工序从分解到批次 DONE，告警推送与落库一致
// ==========================================

#[path = "test_helpers.rs"]
mod test_helpers;

#[cfg(test)]
mod full_flow_e2e_test {
    use super::test_helpers::*;
    use std::sync::Arc;

    use softtoy_production::api::StageInput;
    use softtoy_production::app::AppState;
    use softtoy_production::domain::recipe::MaterialRequirement;
    use softtoy_production::engine::CollectingAlertPublisher;
    use softtoy_production::repository::alert_repo::AlertFilter;
    use softtoy_production::{
        AlertType, DebtStatus, Department, LineState, Qty, RunOptions, RunState, TaskState,
        TransferState,
    };

    // ==========================================
    // 场景A + B: 欠账产生与偿还
    // ==========================================
    #[test]
    fn test_scenario_a_b_debt_lifecycle() {
        let collector = Arc::new(CollectingAlertPublisher::new());
        let (_tmp, state) = create_test_state_with_publisher(collector.clone());
        register_masterdata(&state);
        let wh = &state.warehouse_api;
        wh.receive("PLUSH", LOCATION, q("60"), OPERATOR).unwrap();

        let reserved = wh.reserve("PLUSH", LOCATION, q("100"), OPERATOR).unwrap();
        assert!(reserved.ok);
        assert!(reserved.debt_created);
        let debt = wh.list_debts(Some("PLUSH"), true).unwrap().remove(0);
        assert_eq!(debt.total_qty, q("40"));
        assert_eq!(debt.status, DebtStatus::Active);

        let pushed = collector.drain();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].alert_type, AlertType::DebtCreated);

        let received = wh.receive("PLUSH", LOCATION, q("50"), OPERATOR).unwrap();
        assert_eq!(received.settlements.len(), 1);
        assert_eq!(received.settlements[0].debt_id, debt.debt_id);
        assert_eq!(received.settlements[0].status, DebtStatus::Settled);
        assert_eq!(received.credited_to_stock, q("10"));

        let pos = wh.get_stock_position("PLUSH", LOCATION).unwrap();
        assert_eq!(pos.on_hand, q("110"));
        assert_eq!(pos.reserved, q("100"));
        assert_eq!(pos.on_hand - pos.reserved, q("10"));
        assert_eq!(wh.outstanding_debt("PLUSH").unwrap(), Qty::ZERO);
    }

    // ==========================================
    // 场景C: 缓冲目标
    // ==========================================
    #[test]
    fn test_scenario_c_buffered_targets() {
        let (_tmp, state) = create_test_state();
        seed_bear_with_stock(&state);

        let out = generate(&state, "500");
        let targets: Vec<Qty> = out.tasks.iter().map(|t| t.target_qty).collect();
        assert_eq!(targets, vec![q("550"), q("577"), q("577")]);
        assert_eq!(out.tasks[0].state, TaskState::Ready);
        assert_eq!(out.tasks[1].state, TaskState::Pending);
        assert_eq!(out.tasks[2].state, TaskState::Pending);
    }

    // ==========================================
    // 场景D: 产线占用阻断
    // ==========================================
    #[test]
    fn test_scenario_d_occupied_line_blocks() {
        let (_tmp, state) = create_test_state();
        seed_bear_with_stock(&state);
        let hs = &state.handshake_api;

        let b1 = generate(&state, "100");
        run_to_target(&state, &b1.tasks[0].task_id);
        let b2 = generate(&state, "100");
        run_to_target(&state, &b2.tasks[0].task_id);

        hs.initiate_transfer(&b1.tasks[0].task_id, Department::Embroidery, q("110"), &b1.run.batch_id, OPERATOR)
            .unwrap();
        let before = hs.get_line_status(Department::Embroidery).unwrap();

        let out = hs
            .initiate_transfer(&b2.tasks[0].task_id, Department::Embroidery, q("110"), &b2.run.batch_id, OPERATOR)
            .unwrap();
        assert_eq!(out.transfer.state, TransferState::Blocked);
        assert_eq!(hs.get_line_status(Department::Embroidery).unwrap(), before);
    }

    // ==========================================
    // 场景E: 差异超限拒收；配置放宽后接收，快照恢复
    // ==========================================
    #[test]
    fn test_scenario_e_variance_rejection_and_config() {
        let (_tmp, state) = create_test_state();
        seed_bear_with_stock(&state);
        let hs = &state.handshake_api;
        let cfg = &state.config_api;

        cfg.update_config("variance_tolerance_pct/EMBROIDERY", "10", "qa", "基线")
            .unwrap();
        let snapshot = cfg.get_config_snapshot().unwrap();

        let out = generate(&state, "100");
        run_to_target(&state, &out.tasks[0].task_id);
        let init = hs
            .initiate_transfer(&out.tasks[0].task_id, Department::Embroidery, q("100"), &out.run.batch_id, OPERATOR)
            .unwrap();
        let tid = init.transfer.transfer_id;

        let rejected = hs.accept_transfer(&tid, q("80"), OPERATOR).unwrap();
        assert!(!rejected.accepted);
        assert_eq!(hs.get_transfer(&tid).unwrap().state, TransferState::Locked);

        cfg.update_config("variance_tolerance_pct/EMBROIDERY", "25", "qa", "绣花片复点规则调整")
            .unwrap();
        assert_eq!(cfg.get_policy().unwrap().tolerance_pct(Department::Embroidery), q("25"));
        let accepted = hs.accept_transfer(&tid, q("80"), OPERATOR).unwrap();
        assert!(accepted.accepted);
        assert_eq!(accepted.transfer.state, TransferState::Accepted);

        cfg.restore_from_snapshot(&snapshot, "qa", "回滚试行规则").unwrap();
        assert_eq!(cfg.get_policy().unwrap().tolerance_pct(Department::Embroidery), q("10"));
        assert_eq!(state.action_log_repo.count_by_action_type("UpdateConfig").unwrap(), 3);
    }

    // ==========================================
    // 全链路: 五道工序
    // ==========================================

    fn requirement(material_id: &str, per_unit: &str, wastage: &str) -> MaterialRequirement {
        MaterialRequirement {
            material_id: material_id.to_string(),
            location_id: LOCATION.to_string(),
            qty_per_unit: q(per_unit),
            wastage_pct: q(wastage),
        }
    }

    fn seed_teddy(state: &AppState) {
        register_masterdata(state);
        let md = &state.masterdata_api;
        md.register_material("BOX", "彩盒", q("1"), OPERATOR).unwrap();
        md.register_article("TEDDY", "30cm 泰迪熊", OPERATOR).unwrap();

        let stage = |dept: Department, input: Option<&str>, output: &str, reqs: Vec<MaterialRequirement>| StageInput {
            department: dept,
            input_good: input.map(str::to_string),
            output_good: output.to_string(),
            optional: false,
            buffer_factor: None,
            requirements: reqs,
        };
        md.publish_recipe(
            "TEDDY",
            vec![
                stage(Department::Cutting, None, "PANELS", vec![requirement("PLUSH", "0.35", "5")]),
                stage(Department::Embroidery, Some("PANELS"), "FACES", vec![requirement("THREAD", "1.5", "0")]),
                stage(Department::Sewing, Some("FACES"), "SHELLS", vec![requirement("EYE", "2", "0")]),
                stage(Department::Finishing, Some("SHELLS"), "BEARS", vec![requirement("FIBER", "0.12", "3")]),
                stage(Department::Packing, Some("BEARS"), "BOXED", vec![requirement("BOX", "1", "0")]),
            ],
            OPERATOR,
        )
        .unwrap();

        for (id, qty) in [("PLUSH", "500"), ("THREAD", "500"), ("FIBER", "50"), ("EYE", "500"), ("BOX", "200")] {
            state.warehouse_api.receive(id, LOCATION, q(qty), OPERATOR).unwrap();
        }
    }

    #[test]
    fn test_full_five_stage_flow() {
        let collector = Arc::new(CollectingAlertPublisher::new());
        let (_tmp, state) = create_test_state_with_publisher(collector.clone());
        seed_teddy(&state);
        let prod = &state.production_api;

        let out = prod
            .generate_run("TEDDY", q("50"), "planner", RunOptions::default())
            .unwrap();
        assert_eq!(out.tasks.len(), 5);
        let batch = out.run.batch_id.clone();

        // 目标逐级不减
        for pair in out.tasks.windows(2) {
            assert!(pair[1].target_qty >= pair[0].target_qty);
        }

        let mut carried = None;
        for (idx, task) in out.tasks.iter().enumerate() {
            if let Some(qty) = carried {
                let waiting = prod.get_task(&task.task_id).unwrap();
                assert_eq!(waiting.state, TaskState::Ready);
                assert_eq!(waiting.input_qty, qty);
            }
            let started = prod.start_task(&task.task_id, task.department.to_db_str()).unwrap();
            let produced = started.target_qty;
            let outcome = prod
                .record_task_output(&task.task_id, produced, Qty::ZERO, task.department.to_db_str())
                .unwrap();
            assert_eq!(outcome.task.state, TaskState::Finished);

            match out.tasks.get(idx + 1) {
                Some(next) => {
                    hand_over(&state, &task.task_id, next.department, produced, &batch);
                    carried = Some(produced);
                }
                None => assert!(outcome.run_done),
            }
        }

        let detail = prod.get_run(&out.run.run_id).unwrap();
        assert_eq!(detail.run.state, RunState::Done);
        assert!(detail.tasks.iter().all(|t| t.state == TaskState::Finished));

        // 产线全部释放，预留全部消化
        for line in state.handshake_api.list_lines().unwrap() {
            assert_eq!(line.state, LineState::Clear, "{}", line.department);
            assert!(line.batch_id.is_none());
        }
        for pos in state.warehouse_api.list_positions(None).unwrap() {
            assert_eq!(pos.reserved, Qty::ZERO, "{}", pos.material_id);
        }
        assert!(state.warehouse_api.list_debts(None, true).unwrap().is_empty());

        // 推送的告警与落库一致
        let stored = state.alert_repo.list(&AlertFilter::default()).unwrap();
        assert_eq!(collector.drain().len(), stored.len());

        // 审计日志覆盖每道工序
        let logs = &state.action_log_repo;
        assert_eq!(logs.count_by_action_type("StartTask").unwrap(), 5);
        assert_eq!(logs.count_by_action_type("RecordOutput").unwrap(), 5);
        assert_eq!(logs.count_by_action_type("InitiateTransfer").unwrap(), 4);
        assert_eq!(logs.count_by_action_type("CompleteTransfer").unwrap(), 4);
    }

    // ==========================================
    // 全链路: 跳过可选工序后仍可交接到下一道
    // ==========================================
    #[test]
    fn test_flow_without_optional_stage() {
        let (_tmp, state) = create_test_state();
        seed_bear_with_stock(&state);
        let out = state
            .production_api
            .generate_run(
                ARTICLE,
                q("20"),
                OPERATOR,
                RunOptions {
                    include_optional_stages: false,
                },
            )
            .unwrap();
        let (cut, sew) = (&out.tasks[0], &out.tasks[1]);

        let produced = run_to_target(&state, &cut.task_id);
        assert!(state
            .handshake_api
            .initiate_transfer(&cut.task_id, Department::Embroidery, produced, &out.run.batch_id, OPERATOR)
            .is_err());
        hand_over(&state, &cut.task_id, Department::Sewing, produced, &out.run.batch_id);

        run_to_target(&state, &sew.task_id);
        assert_eq!(
            state.production_api.get_run(&out.run.run_id).unwrap().run.state,
            RunState::Done
        );
        assert_eq!(
            state
                .alert_repo
                .list(&AlertFilter {
                    unacknowledged_only: true,
                    ..Default::default()
                })
                .unwrap()
                .len(),
            0
        );
    }
}
