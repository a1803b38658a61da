use rusqlite::params;

use super::{Db, PassageRecord, RawHit, StoreError, VectorIndex, serialize_vector};

impl Db {
    fn write_records(
        tx: &rusqlite::Transaction<'_>,
        records: &[PassageRecord],
        vectors: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        for (record, vector) in records.iter().zip(vectors) {
            let row_id: i64 = tx.query_row(
                r#"
                INSERT INTO passages (passage_id, document_id, title, url, sequence, content, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(passage_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    title = excluded.title,
                    url = excluded.url,
                    sequence = excluded.sequence,
                    content = excluded.content,
                    indexed_at = CURRENT_TIMESTAMP
                RETURNING id
                "#,
                params![
                    record.id,
                    record.document_id,
                    record.title,
                    record.url,
                    record.sequence as i64,
                    record.content,
                ],
                |row| row.get(0),
            )?;

            // vec0 has no upsert
            tx.execute("DELETE FROM vec_passages WHERE rowid = ?", params![row_id])?;
            tx.execute(
                "INSERT INTO vec_passages (rowid, embedding) VALUES (?, ?)",
                params![row_id, serialize_vector(vector)],
            )?;
        }
        Ok(())
    }

    fn check_batch(&self, records: &[PassageRecord], vectors: &[Vec<f32>]) -> Result<(), StoreError> {
        if records.len() != vectors.len() {
            return Err(StoreError::LengthMismatch {
                records: records.len(),
                vectors: vectors.len(),
            });
        }
        vectors.iter().try_for_each(|v| self.check_dimensions(v))
    }
}

impl VectorIndex for Db {
    fn upsert(&mut self, records: &[PassageRecord], vectors: &[Vec<f32>]) -> Result<(), StoreError> {
        self.check_batch(records, vectors)?;
        let tx = self.conn.transaction()?;
        Self::write_records(&tx, records, vectors)?;
        tx.commit()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM vec_passages", [])?;
        tx.execute("DELETE FROM passages", [])?;
        tx.commit()?;
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RawHit>, StoreError> {
        self.check_dimensions(vector)?;
        self.nearest(vector, k)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM passages", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Clear and insert inside one transaction, so a failed rebuild leaves
    /// the previous contents in place.
    fn replace_all(
        &mut self,
        records: &[PassageRecord],
        vectors: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        self.check_batch(records, vectors)?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM vec_passages", [])?;
        tx.execute("DELETE FROM passages", [])?;
        Self::write_records(&tx, records, vectors)?;
        tx.commit()?;
        Ok(())
    }
}
