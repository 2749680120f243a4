/// Path and table name constants shared by the CLI, config and loader

// Default locations, relative to the working directory
pub const DEFAULT_CUSTOMERS_PATH: &str = "data/raw/customers.csv";
pub const DEFAULT_PRODUCTS_PATH: &str = "data/raw/products.csv";
pub const DEFAULT_SALES_PATH: &str = "data/raw/sales.csv";
pub const DEFAULT_STORE_PATH: &str = "data/dw/keylime_sales.db";
pub const DEFAULT_CONFIG_FILE: &str = "keylime.toml";
pub const DEFAULT_LOG_DIR: &str = "logs";

// Warehouse tables
pub const DATE_TABLE: &str = "dim_date";
pub const CUSTOMER_TABLE: &str = "customer";
pub const PRODUCT_TABLE: &str = "product";
pub const SALES_TABLE: &str = "sales";
pub const REJECTION_TABLE: &str = "rejection_log";

/// Every warehouse table in load order
pub const WAREHOUSE_TABLES: [&str; 5] = [
    DATE_TABLE,
    CUSTOMER_TABLE,
    PRODUCT_TABLE,
    SALES_TABLE,
    REJECTION_TABLE,
];

/// Suffix of the file a run builds before swapping it into place
pub const PARTIAL_SUFFIX: &str = ".partial";
