//! `products` table operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricetrack_core::{NewProduct, Product};
use uuid::Uuid;

use super::PgStore;
use crate::{DbError, ProductStore};

#[derive(Debug, Clone, sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    source_url: String,
    created_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            name: row.name,
            source_url: row.source_url,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl ProductStore for PgStore {
    async fn create_product(&self, product: &NewProduct) -> Result<Product, DbError> {
        let mut tx = self.pool.begin().await.map_err(|source| DbError::Transaction {
            operation: "begin",
            source,
        })?;

        let row = sqlx::query_as::<_, ProductRow>(
            "INSERT INTO products (id, name, source_url, created_at) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, name, source_url, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&product.name)
        .bind(&product.source_url)
        .bind(product.observed_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO price_observations (product_id, price, observed_at) \
             VALUES ($1, $2, $3)",
        )
        .bind(row.id)
        .bind(product.initial_price)
        .bind(product.observed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(|source| DbError::Transaction {
            operation: "commit",
            source,
        })?;

        Ok(row.into())
    }

    async fn product_exists(&self, url: &str) -> Result<bool, DbError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM products WHERE source_url = $1)",
        )
        .bind(url)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn get_product_by_url(&self, url: &str) -> Result<Option<Product>, DbError> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, source_url, created_at FROM products WHERE source_url = $1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Product::from))
    }

    async fn get_product(&self, product_id: Uuid) -> Result<Option<Product>, DbError> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, source_url, created_at FROM products WHERE id = $1",
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Product::from))
    }

    async fn get_product_url_by_id(&self, product_id: Uuid) -> Result<Option<String>, DbError> {
        let url = sqlx::query_scalar::<_, String>("SELECT source_url FROM products WHERE id = $1")
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(url)
    }

    async fn delete_product(&self, product_id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(product_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
