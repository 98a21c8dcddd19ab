//! MongoDB system of record. Every durable table uses a composite string
//! `_id` and `replace_one` with upsert, so re-running a reconciliation
//! refreshes rows in place instead of inserting siblings.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::Database;

use crate::models::durable::{DurableAttemptRow, QuizResultRow, TopicPerformanceRow};
use crate::models::{QuestionInfo, QuizInfo};
use crate::utils::retry::{retry_with_policy, RetryPolicy};

use super::{AttemptRepository, Catalog};

const ATTEMPTS_COLLECTION: &str = "quiz_attempts";
const RESULTS_COLLECTION: &str = "quiz_results";
const TOPIC_COLLECTION: &str = "topic_performance";

pub struct MongoAttemptRepository {
    mongo: Database,
}

impl MongoAttemptRepository {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    async fn upsert_by_id<T: serde::Serialize>(
        &self,
        collection: &str,
        id: &str,
        row: &T,
    ) -> Result<()> {
        let mut document =
            mongodb::bson::to_document(row).context("Failed to serialize durable row")?;
        document.insert("_id", id);

        let coll = self.mongo.collection::<Document>(collection);
        retry_with_policy(&RetryPolicy::for_writes(), || {
            let document = document.clone();
            let coll = coll.clone();
            async move {
                coll.replace_one(doc! { "_id": id }, document)
                    .with_options(
                        mongodb::options::ReplaceOptions::builder()
                            .upsert(true)
                            .build(),
                    )
                    .await
                    .map(|_| ())
            }
        })
        .await
        .with_context(|| format!("Failed to upsert into {}", collection))?;
        Ok(())
    }
}

#[async_trait]
impl AttemptRepository for MongoAttemptRepository {
    async fn upsert_attempts(&self, rows: &[DurableAttemptRow]) -> Result<u64> {
        for row in rows {
            self.upsert_by_id(ATTEMPTS_COLLECTION, &row.key(), row)
                .await?;
        }
        Ok(rows.len() as u64)
    }

    async fn attempts_for(
        &self,
        quiz_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<DurableAttemptRow>> {
        let mut filter = doc! { "quiz_id": quiz_id };
        if let Some(user_id) = user_id {
            filter.insert("user_id", user_id);
        }

        let coll = self.mongo.collection::<Document>(ATTEMPTS_COLLECTION);
        let mut cursor = coll
            .find(filter)
            .await
            .context("Failed to query attempt rows")?;

        let mut rows = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            let row: DurableAttemptRow = mongodb::bson::from_document(document)
                .context("Failed to deserialize attempt row")?;
            rows.push(row);
        }
        Ok(rows)
    }

    async fn upsert_result(&self, row: &QuizResultRow) -> Result<()> {
        self.upsert_by_id(RESULTS_COLLECTION, &row.key(), row).await
    }

    async fn result_for(&self, quiz_id: &str, user_id: &str) -> Result<Option<QuizResultRow>> {
        let coll = self.mongo.collection::<Document>(RESULTS_COLLECTION);
        let document = coll
            .find_one(doc! { "_id": format!("{}:{}", user_id, quiz_id) })
            .await
            .context("Failed to query quiz result")?;

        match document {
            Some(document) => Ok(Some(
                mongodb::bson::from_document(document)
                    .context("Failed to deserialize quiz result")?,
            )),
            None => Ok(None),
        }
    }

    async fn upsert_topic_performance(&self, row: &TopicPerformanceRow) -> Result<()> {
        self.upsert_by_id(TOPIC_COLLECTION, &row.key(), row).await
    }
}

/// Catalog lookups against the platform's `questions` and `quizzes`
/// collections. Question difficulty, correct answers, and quiz windows are
/// owned elsewhere; this engine only reads them.
pub struct MongoCatalog {
    mongo: Database,
}

impl MongoCatalog {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }
}

#[async_trait]
impl Catalog for MongoCatalog {
    async fn question(&self, question_id: &str) -> Result<Option<QuestionInfo>> {
        let coll = self.mongo.collection::<QuestionInfo>("questions");
        coll.find_one(doc! { "_id": question_id })
            .await
            .with_context(|| format!("Failed to query question {}", question_id))
    }

    async fn quiz(&self, quiz_id: &str) -> Result<Option<QuizInfo>> {
        let coll = self.mongo.collection::<QuizInfo>("quizzes");
        let quiz = coll
            .find_one(doc! { "_id": quiz_id })
            .await
            .with_context(|| format!("Failed to query quiz {}", quiz_id))?;

        if let Some(ref quiz) = quiz {
            if quiz.question_ids.is_empty() {
                return Err(anyhow!("quiz {} has no questions", quiz_id));
            }
        }
        Ok(quiz)
    }
}
