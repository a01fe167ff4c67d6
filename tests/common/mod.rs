#![allow(dead_code)]

pub mod mocks;

use std::{
    fs,
    path::{Path, PathBuf},
};

use etl_batch_rs::mapping::resolver::template_path;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Writes a YAML template under `root` where `FileTemplateSource` expects it.
pub fn write_template(root: &Path, source_system: &str, job: &str, transaction_type: &str, body: &str) -> PathBuf {
    let path = root.join(template_path(source_system, job, transaction_type));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, body).unwrap();
    path
}

pub const DEPOSIT_TEMPLATE: &str = "
fileType: FIXED_WIDTH
fields:
  RECORD_TYPE:
    transformationType: constant
    value: D
    targetPosition: 1
    length: 1
  ACCOUNT:
    transformationType: source
    sourceField: ACCOUNT_NO
    targetPosition: 2
    length: 8
    pad: left
    padChar: '0'
  STATUS_DESC:
    transformationType: conditional
    targetPosition: 3
    length: 10
    conditions:
      - ifExpr: STATUS = 'A'
        then: \"'ACTIVE'\"
        elseExpr: \"'INACTIVE'\"
";

pub const WITHDRAWAL_TEMPLATE: &str = "
fileType: DELIMITED
delimiter: ','
fields:
  ACCOUNT:
    transformationType: source
    sourceField: ACCOUNT_NO
    targetPosition: 1
    length: 0
  CHANNEL:
    transformationType: lookup
    sourceField: CHANNEL
    targetPosition: 2
    length: 3
    defaultValue: UNK
    lookup:
      A: ATM
      B: BRN
";
