use std::collections::HashSet;

use sqlx::{Executor, Result, Row, Sqlite, SqliteConnection, SqlitePool};

use crate::model::{ImageRecord, StoredImage};
use crate::schema::CollectionSchema;

/// `IN (...)` 单次绑定的参数数量上限
const CHUNK_SIZE: usize = 500;

fn fts_table(table: &str) -> String {
    format!("{}_fts", table)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// 创建记录表与全文索引表
pub async fn create_tables(conn: &mut SqliteConnection, schema: &CollectionSchema) -> Result<()> {
    let table = &schema.name;
    let fts = fts_table(table);
    conn.execute(
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                seq       INTEGER PRIMARY KEY AUTOINCREMENT,
                id        TEXT NOT NULL UNIQUE,
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                caption   TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#
        )
        .as_str(),
    )
    .await?;
    conn.execute(
        format!(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS "{fts}"
            USING fts5(id UNINDEXED, caption, tokenize = '{}')
            "#,
            schema.text_index.tokenizer.as_fts5()
        )
        .as_str(),
    )
    .await?;
    Ok(())
}

/// 登记集合定义，已存在时不覆盖
pub async fn register_collection<'c, E>(executor: E, name: &str, schema: &str) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO collection (name, schema)
        VALUES (?, ?)
        "#,
    )
    .bind(name)
    .bind(schema)
    .execute(executor)
    .await?;
    Ok(())
}

/// 读取集合定义的 JSON
pub async fn get_collection(executor: &SqlitePool, name: &str) -> Result<Option<String>> {
    let row = sqlx::query(
        r#"
        SELECT schema FROM collection WHERE name = ?
        "#,
    )
    .bind(name)
    .fetch_optional(executor)
    .await?;
    row.map(|row| row.try_get("schema")).transpose()
}

/// 写入一条记录，ID 已存在时返回 None
pub async fn insert_record(
    conn: &mut SqliteConnection,
    table: &str,
    record: &ImageRecord,
) -> Result<Option<i64>> {
    let embedding: &[u8] = bytemuck::cast_slice(record.embedding.as_slice());
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO "{table}" (id, file_name, file_path, caption, embedding)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (id) DO NOTHING
        RETURNING seq
        "#
    ))
    .bind(&record.id)
    .bind(&record.file_name)
    .bind(&record.file_path)
    .bind(&record.caption)
    .bind(embedding)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let seq: i64 = row.try_get("seq")?;

    sqlx::query(&format!(
        r#"
        INSERT INTO "{}" (rowid, id, caption) VALUES (?, ?, ?)
        "#,
        fts_table(table)
    ))
    .bind(seq)
    .bind(&record.id)
    .bind(&record.caption)
    .execute(&mut *conn)
    .await?;

    Ok(Some(seq))
}

/// 返回给定 ID 中已存在的部分
pub async fn existing_ids(
    executor: &SqlitePool,
    table: &str,
    ids: &[String],
) -> Result<HashSet<String>> {
    let mut found = HashSet::new();
    for chunk in ids.chunks(CHUNK_SIZE) {
        let sql = format!(r#"SELECT id FROM "{table}" WHERE id IN ({})"#, placeholders(chunk.len()));
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        for row in query.fetch_all(executor).await? {
            found.insert(row.try_get("id")?);
        }
    }
    Ok(found)
}

/// 读取 seq 大于给定值的向量，用于增量刷新索引
pub async fn vectors_after(
    executor: &SqlitePool,
    table: &str,
    seq: i64,
) -> Result<Vec<(i64, String, Vec<f32>)>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT seq, id, embedding FROM "{table}"
        WHERE seq > ?
        ORDER BY seq ASC
        "#
    ))
    .bind(seq)
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|row| {
            let blob: Vec<u8> = row.try_get("embedding")?;
            Ok((row.try_get("seq")?, row.try_get("id")?, bytemuck::pod_collect_to_vec(&blob)))
        })
        .collect()
}

/// 全文检索，返回 (ID, 相关度)，相关度越大越相关
pub async fn search_caption(
    executor: &SqlitePool,
    table: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<(String, f32)>> {
    let fts = fts_table(table);
    let rows = sqlx::query(&format!(
        r#"
        SELECT id, -bm25("{fts}") AS relevance FROM "{fts}"
        WHERE "{fts}" MATCH ?
        ORDER BY relevance DESC, id ASC
        LIMIT ?
        "#
    ))
    .bind(query)
    .bind(limit as i64)
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get::<f64, _>("relevance")? as f32)))
        .collect()
}

/// 按 ID 读取记录
pub async fn get_records(
    executor: &SqlitePool,
    table: &str,
    ids: &[String],
) -> Result<Vec<StoredImage>> {
    let mut records = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(CHUNK_SIZE) {
        let sql = format!(
            r#"SELECT id, file_name, file_path, caption FROM "{table}" WHERE id IN ({})"#,
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        for row in query.fetch_all(executor).await? {
            records.push(StoredImage {
                id: row.try_get("id")?,
                file_name: row.try_get("file_name")?,
                file_path: row.try_get("file_path")?,
                caption: row.try_get("caption")?,
            });
        }
    }
    Ok(records)
}

pub async fn count_records(executor: &SqlitePool, table: &str) -> Result<i64> {
    let row = sqlx::query(&format!(r#"SELECT COUNT(*) AS count FROM "{table}""#))
        .fetch_one(executor)
        .await?;
    row.try_get("count")
}

/// 将用户输入转换为 FTS5 查询，每个词单独加引号后用 OR 连接
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query() {
        assert_eq!(fts_query("dog").as_deref(), Some("\"dog\""));
        assert_eq!(
            fts_query("  Golden-retriever, dog!").as_deref(),
            Some("\"Golden\" OR \"retriever\" OR \"dog\"")
        );
        assert_eq!(fts_query("\" AND NOT *").as_deref(), Some("\"AND\" OR \"NOT\""));
        assert_eq!(fts_query("小狗").as_deref(), Some("\"小狗\""));
        assert_eq!(fts_query("  ...  "), None);
    }
}
