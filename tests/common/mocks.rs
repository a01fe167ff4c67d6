//! Mock versions of the configuration stores.
use mockall::mock;

use etl_batch_rs::{
    mapping::resolver::JobConfigurationStore,
    partition::partitioner::{TransactionTypeConfig, TransactionTypeConfigStore},
    BatchError,
};

mock! {
    pub JobStore {}
    impl JobConfigurationStore for JobStore {
        fn fetch(&self, config_id: &str) -> Result<Option<String>, BatchError>;
    }
}

mock! {
    pub TypeStore {}
    impl TransactionTypeConfigStore for TypeStore {
        fn load_for_job(&self, source_system: &str, job: &str) -> Result<Vec<TransactionTypeConfig>, BatchError>;
    }
}
