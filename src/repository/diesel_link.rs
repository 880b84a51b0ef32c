//! Diesel-based contributor/repository link storage for SQLite.

use diesel::prelude::*;
use diesel::upsert::excluded;

use super::diesel_models::ContributorRepositoryRecord;
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::parse_datetime_opt;
use crate::models::ContributorRepositoryLink;
use crate::schema::contributor_repositories;

impl From<ContributorRepositoryRecord> for ContributorRepositoryLink {
    fn from(record: ContributorRepositoryRecord) -> Self {
        ContributorRepositoryLink {
            contributor_id: record.contributor_id,
            repository_id: record.repository_id,
            commit_count: record.commit_count,
            pull_requests: record.pull_requests,
            reviews: record.reviews,
            issues_opened: record.issues_opened,
            lines_added: record.lines_added,
            lines_removed: record.lines_removed,
            first_contribution_date: parse_datetime_opt(record.first_contribution_date),
            last_contribution_date: parse_datetime_opt(record.last_contribution_date),
        }
    }
}

impl From<&ContributorRepositoryLink> for ContributorRepositoryRecord {
    fn from(link: &ContributorRepositoryLink) -> Self {
        ContributorRepositoryRecord {
            contributor_id: link.contributor_id.clone(),
            repository_id: link.repository_id.clone(),
            commit_count: link.commit_count,
            pull_requests: link.pull_requests,
            reviews: link.reviews,
            issues_opened: link.issues_opened,
            lines_added: link.lines_added,
            lines_removed: link.lines_removed,
            first_contribution_date: link.first_contribution_date.map(|d| d.to_rfc3339()),
            last_contribution_date: link.last_contribution_date.map(|d| d.to_rfc3339()),
        }
    }
}

/// Diesel-based link repository.
#[derive(Clone)]
pub struct DieselLinkRepository {
    pool: SqlitePool,
}

impl DieselLinkRepository {
    /// Create a new Diesel link repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Make the stored links of a repository exactly `links`: upsert each
    /// pair and drop pairs that no longer have activity.
    pub async fn replace_for_repository(
        &self,
        repository_id: &str,
        links: Vec<ContributorRepositoryLink>,
    ) -> Result<usize, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let keep: Vec<&str> = links.iter().map(|l| l.contributor_id.as_str()).collect();
                diesel::delete(
                    contributor_repositories::table
                        .filter(contributor_repositories::repository_id.eq(&repository_id))
                        .filter(contributor_repositories::contributor_id.ne_all(keep)),
                )
                .execute(conn)?;

                for link in &links {
                    let record = ContributorRepositoryRecord::from(link);
                    diesel::insert_into(contributor_repositories::table)
                        .values(&record)
                        .on_conflict((
                            contributor_repositories::contributor_id,
                            contributor_repositories::repository_id,
                        ))
                        .do_update()
                        .set((
                            contributor_repositories::commit_count
                                .eq(excluded(contributor_repositories::commit_count)),
                            contributor_repositories::pull_requests
                                .eq(excluded(contributor_repositories::pull_requests)),
                            contributor_repositories::reviews
                                .eq(excluded(contributor_repositories::reviews)),
                            contributor_repositories::issues_opened
                                .eq(excluded(contributor_repositories::issues_opened)),
                            contributor_repositories::lines_added
                                .eq(excluded(contributor_repositories::lines_added)),
                            contributor_repositories::lines_removed
                                .eq(excluded(contributor_repositories::lines_removed)),
                            contributor_repositories::first_contribution_date
                                .eq(excluded(contributor_repositories::first_contribution_date)),
                            contributor_repositories::last_contribution_date
                                .eq(excluded(contributor_repositories::last_contribution_date)),
                        ))
                        .execute(conn)?;
                }
                Ok(links.len())
            })
        })
        .await
    }

    /// Links of one repository.
    pub async fn for_repository(
        &self,
        repository_id: &str,
    ) -> Result<Vec<ContributorRepositoryLink>, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            contributor_repositories::table
                .filter(contributor_repositories::repository_id.eq(&repository_id))
                .order(contributor_repositories::commit_count.desc())
                .load::<ContributorRepositoryRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(ContributorRepositoryLink::from).collect())
    }

    /// Every link.
    pub async fn get_all(&self) -> Result<Vec<ContributorRepositoryLink>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            contributor_repositories::table.load::<ContributorRepositoryRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(ContributorRepositoryLink::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    fn link(contributor: &str, commits: i32) -> ContributorRepositoryLink {
        ContributorRepositoryLink {
            contributor_id: contributor.to_string(),
            repository_id: "repo-1".to_string(),
            commit_count: commits,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replace_is_idempotent_and_prunes() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DieselLinkRepository::new(pool);

        repo.replace_for_repository("repo-1", vec![link("a", 10), link("b", 1)])
            .await
            .unwrap();
        repo.replace_for_repository("repo-1", vec![link("a", 10), link("b", 1)])
            .await
            .unwrap();
        assert_eq!(repo.for_repository("repo-1").await.unwrap().len(), 2);

        repo.replace_for_repository("repo-1", vec![link("a", 11)]).await.unwrap();
        let links = repo.for_repository("repo-1").await.unwrap();
        assert_eq!(links, vec![link("a", 11)]);
    }
}
