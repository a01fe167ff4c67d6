pub mod common;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use common::{init_logger, mocks::MockTypeStore, write_template, DEPOSIT_TEMPLATE, WITHDRAWAL_TEMPLATE};
use etl_batch_rs::{
    core::{
        job::{BatchStatus, Job, JobBuilder},
        step::StepStatus,
    },
    mapping::{processor::FieldProtector, processor::HashingProtector, resolver::ConfigurationResolverBuilder},
    partition::{
        Partitioner, PartitionStepBuilder, RetryConfiguration, TransactionTypeConfig,
        TransactionTypePartitionerBuilder,
    },
    pipeline::TransactionTypeWorkerBuilder,
    tracker::{idempotency_key, IdempotencyTrackerBuilder, ProcessingState},
    BatchError,
};

struct Workspace {
    _dir: tempfile::TempDir,
    templates: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

fn workspace() -> Workspace {
    let dir = tempfile::tempdir().unwrap();
    let templates = dir.path().join("templates");
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    fs::create_dir_all(&input).unwrap();
    fs::create_dir_all(&output).unwrap();

    write_template(&templates, "CORE", "LOAD_TXN", "DEPOSIT", DEPOSIT_TEMPLATE);
    write_template(&templates, "CORE", "LOAD_TXN", "WITHDRAWAL", WITHDRAWAL_TEMPLATE);
    fs::write(input.join("DEPOSIT.csv"), "ACCOUNT_NO,STATUS\n123,A\n4567,X\n").unwrap();
    fs::write(input.join("WITHDRAWAL.csv"), "ACCOUNT_NO,CHANNEL\n99,A\n77,Z\n").unwrap();

    Workspace {
        _dir: dir,
        templates,
        input,
        output,
    }
}

fn type_config(input: &Path, transaction_type: &str, order: u32) -> TransactionTypeConfig {
    let mut config = TransactionTypeConfig::new(transaction_type, order);
    config.chunk_size = 1;
    config.input_path = Some(input.join(format!("{transaction_type}.csv")));
    config
}

fn store_returning(configs: Vec<TransactionTypeConfig>) -> MockTypeStore {
    let mut store = MockTypeStore::new();
    store
        .expect_load_for_job()
        .withf(|source_system, job| source_system == "CORE" && job == "LOAD_TXN")
        .returning(move |_, _| Ok(configs.clone()));
    store
}

#[test]
fn partitioned_job_writes_one_file_per_transaction_type() -> anyhow::Result<()> {
    init_logger();
    let ws = workspace();
    let mut withdrawal = type_config(&ws.input, "WITHDRAWAL", 2);
    withdrawal.encryption_required = true;
    withdrawal.encryption_fields = vec!["ACCOUNT".to_string()];
    let store = store_returning(vec![withdrawal, type_config(&ws.input, "DEPOSIT", 1)]);

    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let protector = Arc::new(HashingProtector::new("pepper"));
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-1")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .protector(protector.clone())
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .grid_size(2)
        .build()?;

    let job = JobBuilder::new().name("load-txn".to_string()).start(&step).build();
    let execution = job.run()?;

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(execution.step_executions[0].read_count, 4);
    assert_eq!(execution.step_executions[0].write_count, 4);
    assert_eq!(
        fs::read_to_string(ws.output.join("DEPOSIT.dat"))?,
        "D00000123ACTIVE    \nD00004567INACTIVE  \n"
    );
    assert_eq!(
        fs::read_to_string(ws.output.join("WITHDRAWAL.dat"))?,
        format!(
            "{},ATM\n{},UNK\n",
            protector.protect("ACCOUNT", "99"),
            protector.protect("ACCOUNT", "77")
        )
    );

    for transaction_type in ["DEPOSIT", "WITHDRAWAL"] {
        let key = idempotency_key("CORE", "LOAD_TXN", &format!("RUN-1-{transaction_type}"));
        let record = tracker.get(&key)?.unwrap();
        assert_eq!(record.state, ProcessingState::Completed);
        assert!(tracker.audit().verify_chain(&key)?.is_empty());
    }

    let executions = step.partition_executions();
    assert_eq!(
        executions.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["partition-DEPOSIT", "partition-WITHDRAWAL"]
    );
    Ok(())
}

#[test]
fn rerunning_a_completed_run_skips_its_partitions() -> anyhow::Result<()> {
    let ws = workspace();
    let store = store_returning(vec![type_config(&ws.input, "DEPOSIT", 1)]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-2")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    JobBuilder::new().start(&step).build().run()?;
    fs::remove_file(ws.output.join("DEPOSIT.dat"))?;
    let rerun = JobBuilder::new().start(&step).build().run()?;

    assert_eq!(rerun.step_executions[0].write_count, 0);
    assert!(!ws.output.join("DEPOSIT.dat").exists());
    let key = idempotency_key("CORE", "LOAD_TXN", "RUN-2-DEPOSIT");
    assert_eq!(tracker.audit().records_for(&key)?.len(), 2);
    Ok(())
}

#[test]
fn a_misconfigured_partition_fails_alone() -> anyhow::Result<()> {
    let ws = workspace();
    fs::write(ws.input.join("FEE.csv"), "ACCOUNT_NO\n1\n")?;
    let store = store_returning(vec![
        type_config(&ws.input, "DEPOSIT", 1),
        type_config(&ws.input, "FEE", 2),
    ]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-3")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .grid_size(2)
        .build()?;

    let execution = JobBuilder::new().start(&step).build().execute();

    assert_eq!(execution.status, BatchStatus::Failed);
    assert!(execution.error_message.unwrap().contains("partition-FEE"));
    assert!(ws.output.join("DEPOSIT.dat").exists());

    let fee = tracker
        .get(&idempotency_key("CORE", "LOAD_TXN", "RUN-3-FEE"))?
        .unwrap();
    assert_eq!(fee.state, ProcessingState::Failed);
    assert!(fee.error_details.unwrap().contains("FEE"));

    let partitions = step.partition_executions();
    let statuses: Vec<_> = partitions.iter().map(|e| (e.name.as_str(), e.status)).collect();
    assert_eq!(
        statuses,
        vec![("partition-DEPOSIT", StepStatus::Success), ("partition-FEE", StepStatus::Failed)]
    );
    Ok(())
}

#[test]
fn a_partition_held_by_another_claimant_is_not_executed() -> anyhow::Result<()> {
    let ws = workspace();
    let store = store_returning(vec![type_config(&ws.input, "DEPOSIT", 1)]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let held = tracker.begin_or_reuse("CORE", "LOAD_TXN", "RUN-10-DEPOSIT")?;
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-10")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    let execution = JobBuilder::new().start(&step).build().execute();

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(execution.step_executions[0].write_count, 0);
    assert!(!ws.output.join("DEPOSIT.dat").exists());

    let partition = &step.partition_executions()[0];
    assert_eq!(partition.status, StepStatus::Failed);
    assert!(partition.error_message.as_deref().unwrap().contains(&held.key));

    assert_eq!(tracker.get(&held.key)?, Some(held.clone()));
    assert_eq!(tracker.audit().records_for(&held.key)?.len(), 1);
    Ok(())
}

#[test]
fn malformed_rows_are_skipped_and_counted() -> anyhow::Result<()> {
    let ws = workspace();
    fs::write(ws.input.join("DEPOSIT.csv"), "ACCOUNT_NO,STATUS\n123,A\n9,A,EXTRA\n456,A\n")?;
    let mut deposit = type_config(&ws.input, "DEPOSIT", 1);
    deposit.chunk_size = 10;
    let store = store_returning(vec![deposit]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-11")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    let execution = JobBuilder::new().start(&step).build().run()?;

    let transform = &execution.step_executions[0];
    assert_eq!(transform.write_count, 2);
    assert_eq!(transform.read_error_count, 1);
    assert_eq!(
        fs::read_to_string(ws.output.join("DEPOSIT.dat"))?,
        "D00000123ACTIVE    \nD00000456ACTIVE    \n"
    );

    let record = tracker
        .get(&idempotency_key("CORE", "LOAD_TXN", "RUN-11-DEPOSIT"))?
        .unwrap();
    assert_eq!(record.state, ProcessingState::Completed);
    let summary: serde_json::Value = serde_json::from_str(record.response_payload.as_deref().unwrap())?;
    assert_eq!(summary["skipped"], 1);
    assert_eq!(summary["isolationLevel"], "READ_COMMITTED");
    Ok(())
}

#[test]
fn partitions_carry_their_own_retry_ceiling() -> anyhow::Result<()> {
    let ws = workspace();
    fs::write(ws.input.join("FEE.csv"), "ACCOUNT_NO\n1\n")?;
    let mut fee = type_config(&ws.input, "FEE", 1);
    fee.retry_configuration = RetryConfiguration::none();
    let store = store_returning(vec![fee]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().max_retries(5).build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-12")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    JobBuilder::new().start(&step).build().execute();
    let key = idempotency_key("CORE", "LOAD_TXN", "RUN-12-FEE");
    let record = tracker.get(&key)?.unwrap();
    assert_eq!(record.max_retries, 0);
    assert!(record.is_terminal());

    let rerun = JobBuilder::new().start(&step).build().execute();
    assert_eq!(rerun.status, BatchStatus::Failed);
    assert!(step.partition_executions()[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("no retries left"));
    assert_eq!(tracker.audit().records_for(&key)?.len(), 2);
    Ok(())
}

#[test]
fn overrunning_its_timeout_fails_the_partition() -> anyhow::Result<()> {
    let ws = workspace();
    let mut deposit = type_config(&ws.input, "DEPOSIT", 1);
    deposit.timeout_seconds = 0;
    let store = store_returning(vec![deposit]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-13")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    let execution = JobBuilder::new().start(&step).build().execute();

    assert_eq!(execution.status, BatchStatus::Failed);
    let record = tracker
        .get(&idempotency_key("CORE", "LOAD_TXN", "RUN-13-DEPOSIT"))?
        .unwrap();
    assert_eq!(record.state, ProcessingState::Failed);
    assert!(record.error_details.unwrap().contains("timeout"));
    Ok(())
}

#[test]
fn encryption_without_a_protector_fails_the_partition() -> anyhow::Result<()> {
    let ws = workspace();
    let mut deposit = type_config(&ws.input, "DEPOSIT", 1);
    deposit.encryption_required = true;
    deposit.encryption_fields = vec!["ACCOUNT".to_string()];
    let store = store_returning(vec![deposit]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-4")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    let execution = JobBuilder::new().start(&step).build().execute();

    assert_eq!(execution.status, BatchStatus::Failed);
    assert!(!ws.output.join("DEPOSIT.dat").exists());
    Ok(())
}

#[test]
fn missing_transaction_types_fall_back_to_input_files() -> anyhow::Result<()> {
    let ws = workspace();
    let store = store_returning(Vec::new());
    let files = vec![ws.input.join("DEPOSIT.csv"), ws.input.join("WITHDRAWAL.csv")];
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .fallback_files(files)
        .fallback_chunk_size(50)
        .fallback_retry(RetryConfiguration::none())
        .build()?;

    let partitions = partitioner.partition(4)?;

    assert_eq!(partitions.keys().collect::<Vec<_>>(), vec!["partition0", "partition1"]);
    let first = &partitions["partition0"];
    assert!(first.fallback);
    assert_eq!(first.transaction_type, "DEPOSIT");
    assert_eq!(first.chunk_size, 50);
    assert_eq!(first.file_config.input_path.as_deref(), Some(ws.input.join("DEPOSIT.csv").as_path()));
    assert_eq!(first.execution_id, partitions["partition1"].execution_id);

    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let worker = TransactionTypeWorkerBuilder::new("RUN-5")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;
    JobBuilder::new().start(&step).build().run()?;

    assert!(ws.output.join("DEPOSIT.dat").exists());
    assert!(ws.output.join("WITHDRAWAL.dat").exists());
    Ok(())
}

#[test]
fn unreadable_transaction_types_abort_the_job_before_any_work() -> anyhow::Result<()> {
    let ws = workspace();
    let mut store = MockTypeStore::new();
    store
        .expect_load_for_job()
        .returning(|_, _| Err(BatchError::ItemReader("ORA-12541: no listener".to_string())));
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .fallback_files(vec![ws.input.join("DEPOSIT.csv")])
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-6")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    assert!(matches!(partitioner.partition(4), Err(BatchError::Partition(_))));

    let execution = JobBuilder::new().start(&step).build().execute();
    assert_eq!(execution.status, BatchStatus::Failed);
    assert!(step.partition_executions().is_empty());
    assert_eq!(fs::read_dir(&ws.output)?.count(), 0);
    Ok(())
}

#[test]
fn dry_run_logs_instead_of_writing() -> anyhow::Result<()> {
    init_logger();
    let ws = workspace();
    let store = store_returning(vec![type_config(&ws.input, "DEPOSIT", 1)]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-7")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .dry_run(true)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    let execution = JobBuilder::new().start(&step).build().run()?;

    assert_eq!(execution.step_executions[0].write_count, 2);
    assert_eq!(fs::read_dir(&ws.output)?.count(), 0);
    Ok(())
}

#[cfg(unix)]
#[test]
fn partition_output_feeds_the_bulk_loader() -> anyhow::Result<()> {
    use etl_batch_rs::{
        core::step::StepBuilder,
        tasklet::bulk_load::{BulkLoadStatus, BulkLoadTaskletBuilder},
    };

    let ws = workspace();
    let store = store_returning(vec![type_config(&ws.input, "DEPOSIT", 1)]);
    let resolver = ConfigurationResolverBuilder::new().template_root(&ws.templates).build();
    let tracker = IdempotencyTrackerBuilder::new().build();
    let partitioner = TransactionTypePartitionerBuilder::new("CORE", "LOAD_TXN")
        .store(&store)
        .build()?;
    let worker = TransactionTypeWorkerBuilder::new("RUN-8")
        .resolver(&resolver)
        .tracker(&tracker)
        .output_dir(&ws.output)
        .build()?;
    let transform = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .build()?;

    let script = ws.output.join("loader.sh");
    fs::write(
        &script,
        "for a in \"$@\"; do case \"$a\" in log=*) LOG=\"${a#log=}\";; data=*) DATA=\"${a#data=}\";; esac; done\n\
         echo \"  $(wc -l < \"$DATA\" | tr -d ' ') Rows successfully loaded.\" > \"$LOG\"\n",
    )?;
    let loader = BulkLoadTaskletBuilder::new("sh")
        .arg(&script.to_string_lossy())
        .control_file(ws.output.join("DEPOSIT.ctl"))
        .data_file(ws.output.join("DEPOSIT.dat"))
        .log_file(ws.output.join("DEPOSIT.log"))
        .build()?;
    let load = StepBuilder::new("load").tasklet(&loader).build()?;

    JobBuilder::new().start(&transform).next(&load).build().run()?;

    let result = loader.last_result().unwrap();
    assert_eq!(result.status, BulkLoadStatus::Success);
    assert_eq!(result.rows_loaded, Some(2));
    Ok(())
}

#[test]
fn engine_settings_wire_the_whole_job() -> anyhow::Result<()> {
    use etl_batch_rs::settings::EngineSettings;

    let ws = workspace();
    write_template(
        &ws.templates,
        "CORE",
        "LOAD_TXN",
        "FEE",
        "
fileType: DELIMITED
fields:
  ACCOUNT:
    transformationType: source
    sourceField: ACCOUNT_NO
    targetPosition: 1
  AMOUNT:
    transformationType: source
    sourceField: AMOUNT
    targetPosition: 2
    dataType: number
    sourceFormat: '0'
    targetFormat: '0.00'
",
    );
    fs::write(ws.input.join("FEE.csv"), "ACCOUNT_NO,AMOUNT\n11,2.5\n")?;
    let settings_path = ws.input.join("engine.yml");
    fs::write(
        &settings_path,
        format!(
            "template_root: {}\noutput_dir: {}\noutput_delimiter: ';'\ngrid_size: 2\nfallback_chunk_size: 10\n",
            ws.templates.display(),
            ws.output.display()
        ),
    )?;
    let settings = EngineSettings::from_path(&settings_path)?;

    let store = store_returning(Vec::new());
    let resolver = settings.resolver_builder().build();
    let tracker = settings.tracker_builder().build();
    let partitioner = settings
        .partitioner_builder("CORE", "LOAD_TXN")
        .store(&store)
        .fallback_files(vec![ws.input.join("FEE.csv")])
        .build()?;
    let worker = settings
        .worker_builder("RUN-9")
        .resolver(&resolver)
        .tracker(&tracker)
        .build()?;
    let step = PartitionStepBuilder::new("transform")
        .partitioner(&partitioner)
        .worker(&worker)
        .grid_size(settings.grid_size)
        .build()?;

    JobBuilder::new().start(&step).build().run()?;

    assert_eq!(fs::read_to_string(ws.output.join("FEE.dat"))?, "11;2.50\n");
    Ok(())
}
