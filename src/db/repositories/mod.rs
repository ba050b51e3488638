mod presets;
mod workouts;
mod zones;
