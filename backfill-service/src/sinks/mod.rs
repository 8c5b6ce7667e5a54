mod postgres_store;

pub use postgres_store::PostgresStatisticsStore;
