use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BackendSnapshot::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BackendSnapshot::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(BackendSnapshot::CapturedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(BackendSnapshot::BackendUrl).string().not_null())
                    .col(ColumnDef::new(BackendSnapshot::CpuPercent).double())
                    .col(ColumnDef::new(BackendSnapshot::RamPercent).double())
                    .col(ColumnDef::new(BackendSnapshot::ActiveJobs).integer())
                    .col(ColumnDef::new(BackendSnapshot::QueuedJobs).integer())
                    .col(ColumnDef::new(BackendSnapshot::LoadedModels).integer())
                    .col(ColumnDef::new(BackendSnapshot::VramUsedGb).double())
                    .col(ColumnDef::new(BackendSnapshot::AvgTokensPerSecond).double())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("backend_snapshot_backend_url_idx")
                    .table(BackendSnapshot::Table)
                    .col(BackendSnapshot::BackendUrl)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("backend_snapshot_captured_at_idx")
                    .table(BackendSnapshot::Table)
                    .col(BackendSnapshot::CapturedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BackendSnapshot::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum BackendSnapshot {
    Table,
    Id,
    CapturedAt,
    BackendUrl,
    CpuPercent,
    RamPercent,
    ActiveJobs,
    QueuedJobs,
    LoadedModels,
    VramUsedGb,
    AvgTokensPerSecond,
}
