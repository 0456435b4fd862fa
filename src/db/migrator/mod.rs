use sea_orm_migration::prelude::*;

mod m20260101_000001_create_job_table;
mod m20260101_000002_create_job_archive_table;
mod m20260101_000003_create_backend_snapshot_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_create_job_table::Migration),
            Box::new(m20260101_000002_create_job_archive_table::Migration),
            Box::new(m20260101_000003_create_backend_snapshot_table::Migration),
        ]
    }
}
