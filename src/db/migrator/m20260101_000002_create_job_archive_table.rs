use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobArchive::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobArchive::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobArchive::UserId).string().not_null())
                    .col(ColumnDef::new(JobArchive::Status).string().not_null())
                    .col(
                        ColumnDef::new(JobArchive::Priority)
                            .integer()
                            .not_null()
                            .default(5),
                    )
                    .col(
                        ColumnDef::new(JobArchive::PriorityScore)
                            .double()
                            .not_null()
                            .default(5.0),
                    )
                    .col(ColumnDef::new(JobArchive::ModelId).string())
                    .col(ColumnDef::new(JobArchive::BackendUrl).string())
                    .col(ColumnDef::new(JobArchive::Request).text())
                    .col(ColumnDef::new(JobArchive::Result).text())
                    .col(ColumnDef::new(JobArchive::Error).text())
                    .col(
                        ColumnDef::new(JobArchive::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(JobArchive::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(JobArchive::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(JobArchive::UpdatedAt).big_integer().not_null())
                    .col(
                        ColumnDef::new(JobArchive::ArchivedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("job_archive_user_id_idx")
                    .table(JobArchive::Table)
                    .col(JobArchive::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("job_archive_status_idx")
                    .table(JobArchive::Table)
                    .col(JobArchive::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("job_archive_created_at_idx")
                    .table(JobArchive::Table)
                    .col(JobArchive::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("job_archive_archived_at_idx")
                    .table(JobArchive::Table)
                    .col(JobArchive::ArchivedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobArchive::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum JobArchive {
    Table,
    Id,
    UserId,
    Status,
    Priority,
    PriorityScore,
    ModelId,
    BackendUrl,
    Request,
    Result,
    Error,
    AttemptCount,
    MaxAttempts,
    CreatedAt,
    UpdatedAt,
    ArchivedAt,
}
