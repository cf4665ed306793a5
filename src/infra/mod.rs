pub mod tfnsw;
