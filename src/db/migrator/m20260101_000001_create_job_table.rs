use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Job::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Job::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(Job::UserId).string().not_null())
                    .col(ColumnDef::new(Job::Status).string().not_null())
                    .col(ColumnDef::new(Job::Priority).integer().not_null().default(5))
                    .col(
                        ColumnDef::new(Job::PriorityScore)
                            .double()
                            .not_null()
                            .default(5.0),
                    )
                    .col(ColumnDef::new(Job::ModelId).string())
                    .col(ColumnDef::new(Job::BackendUrl).string())
                    .col(ColumnDef::new(Job::Request).text())
                    .col(ColumnDef::new(Job::Result).text())
                    .col(ColumnDef::new(Job::Error).text())
                    .col(
                        ColumnDef::new(Job::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Job::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(Job::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(Job::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("job_user_id_idx")
                    .table(Job::Table)
                    .col(Job::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("job_user_status_idx")
                    .table(Job::Table)
                    .col(Job::UserId)
                    .col(Job::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("job_created_at_idx")
                    .table(Job::Table)
                    .col(Job::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("job_status_priority_score_idx")
                    .table(Job::Table)
                    .col(Job::Status)
                    .col(Job::PriorityScore)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Job::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Job {
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
}
