use rusqlite::params;

use super::{Db, HitMetadata, RawHit, StoreError, serialize_vector};

fn map_hit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawHit> {
    Ok(RawHit {
        id: row.get(0)?,
        content: row.get(1)?,
        metadata: HitMetadata {
            document_id: row.get(2)?,
            title: row.get(3)?,
            url: row.get(4)?,
        },
        distance: row.get(5)?,
    })
}

impl Db {
    /// Cosine-distance scan over every stored vector, closest first.
    pub(crate) fn nearest(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<RawHit>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT
                p.passage_id,
                p.content,
                p.document_id,
                p.title,
                p.url,
                vec_distance_cosine(v.embedding, ?) AS distance
            FROM vec_passages v
            JOIN passages p ON v.rowid = p.id
            ORDER BY distance ASC, p.id ASC
            LIMIT ?
            "#,
        )?;

        let rows = stmt.query_map(
            params![serialize_vector(query_vector), top_k as i64],
            map_hit_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
